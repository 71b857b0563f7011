//! Relay server controller
//!
//! Runs the local relay backend of one server: the process that accepts
//! SOCKS5 on a loopback port and speaks the server's protocol upstream.
//! SOCKS5 servers need no relay and get no controller.

use crate::args::RelayTarget;
use crate::backend::{self, LaunchSpec};
use crate::context::ControlContext;
use crate::error::ControlError;
use crate::model::{ProtocolFamily, ServerDescriptor};
use crate::platform::offload;
use crate::process::{self, ProcessHandle};
use crate::readiness::ReadinessWatcher;
use crate::state::ControllerState;
use tracing::{debug, info, warn};

/// Controller of one relay backend process
#[derive(Debug)]
pub struct ServerController {
    ctx: ControlContext,
    family: ProtocolFamily,
    name: String,
    remark: String,
    port: u16,
    kill_stale: bool,
    state: ControllerState,
    process: Option<ProcessHandle>,
}

impl ServerController {
    /// Controller for the session's primary relay on the SOCKS5 local port
    pub fn primary(ctx: ControlContext, family: ProtocolFamily) -> Option<Self> {
        let port = ctx.settings.socks5_local_port;
        let kill_stale = ctx.settings.kill_stale_instances;
        Self::build(ctx, family, String::new(), port, kill_stale, "")
    }

    /// UDP-only relay on `port`
    ///
    /// Never kills stale instances: the primary may run the same executable.
    pub fn sidecar(ctx: ControlContext, family: ProtocolFamily, port: u16) -> Option<Self> {
        Self::build(ctx, family, "UdpServer".to_string(), port, false, "Udp")
    }

    fn build(
        ctx: ControlContext,
        family: ProtocolFamily,
        remark: String,
        port: u16,
        kill_stale: bool,
        suffix: &str,
    ) -> Option<Self> {
        if !family.has_local_relay() {
            return None;
        }

        Some(Self {
            ctx,
            family,
            name: format!("{}{}", backend::backend_name(family), suffix),
            remark,
            port,
            kill_stale,
            state: ControllerState::Stopped,
            process: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remark(&self) -> &str {
        &self.remark
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn family(&self) -> ProtocolFamily {
        self.family
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Pid of the backend while it runs
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// Kill leftovers of this backend's executable from earlier runs
    ///
    /// Does nothing for sidecars or when disabled in settings. Runs before the
    /// port preflight so a stale instance cannot hold the port.
    pub async fn kill_stale_instances(&self) -> usize {
        if !self.kill_stale {
            return 0;
        }

        let Some(executable) = backend::executable(self.family) else {
            return 0;
        };
        match offload(move || Ok(process::kill_stale_instances(executable))).await {
            Ok(killed) => {
                debug!("Killed {} stale {} instances", killed, executable);
                killed
            }
            Err(e) => {
                warn!("Stale instance cleanup failed: {}", e);
                0
            }
        }
    }

    fn set_state(&mut self, state: ControllerState) {
        self.state = state;
        self.ctx.events.state_changed(&self.name, state);
    }

    /// Start relaying `server`, a resolved working copy
    pub async fn start(&mut self, server: &ServerDescriptor) -> Result<(), ControlError> {
        if self.state.is_active() {
            return Err(ControlError::AlreadyRunning);
        }

        let listen = RelayTarget::listen(&self.ctx.settings, self.port);
        let spec = backend::launch_spec(
            server,
            &listen,
            &self.ctx.settings.paths.work_dir,
            &self.name,
        )
        .ok_or_else(|| ControlError::backend_failed(&self.name, "no local relay backend"))?;

        info!("Starting {} for {} on {}", self.name, server, listen);
        self.ctx.events.status(format!("Starting {}", self.name));
        self.set_state(ControllerState::Starting);

        match self.launch(spec).await {
            Ok(handle) => {
                self.process = Some(handle);
                self.set_state(ControllerState::Started);
                Ok(())
            }
            Err(e) => {
                self.set_state(ControllerState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(&self, spec: LaunchSpec) -> Result<ProcessHandle, ControlError> {
        if let Some(config) = spec.config {
            offload(move || {
                if let Some(dir) = config.path.parent() {
                    std::fs::create_dir_all(dir)?;
                }
                std::fs::write(&config.path, config.contents)
            })
            .await?;
        }

        let watcher = ReadinessWatcher::new(spec.markers, self.ctx.poll_policy());
        ProcessHandle::launch(
            &self.name,
            &self.ctx.bin_path(spec.executable),
            &spec.args,
            &self.ctx.events,
            &watcher,
        )
        .await
    }

    /// Kill the backend; safe to call in any state
    pub async fn stop(&mut self) {
        if let Some(mut process) = self.process.take() {
            self.set_state(ControllerState::Stopping);
            process.stop().await;
        }
        if self.state.is_active() {
            self.set_state(ControllerState::Stopped);
        }
    }
}
