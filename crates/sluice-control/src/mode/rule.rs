//! HTTP rule mode
//!
//! Runs `Privoxy.exe` on the HTTP local port, forwarding everything to the
//! SOCKS5 upstream except the mode's address patterns, which connect
//! directly.

use crate::args::RelayTarget;
use crate::context::ControlContext;
use crate::error::ControlError;
use crate::model::{ModeDescriptor, RuleEntry, ServerDescriptor};
use crate::platform::offload;
use crate::process::ProcessHandle;
use crate::readiness::{Markers, ReadinessWatcher};
use crate::state::ControllerState;
use std::fmt::Write as _;
use tracing::{debug, info};

const NAME: &str = "Privoxy";
const EXECUTABLE: &str = "Privoxy.exe";
const CONFIG_FILE: &str = "privoxy.conf";
const MARKERS: Markers = Markers::new(&["Listening on port"], &["can't bind", "Fatal error"]);

/// Rule mode controller
#[derive(Debug)]
pub struct RuleController {
    ctx: ControlContext,
    state: ControllerState,
    process: Option<ProcessHandle>,
}

impl RuleController {
    pub fn new(ctx: ControlContext) -> Self {
        Self {
            ctx,
            state: ControllerState::Stopped,
            process: None,
        }
    }

    pub fn name(&self) -> &str {
        NAME
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    fn set_state(&mut self, state: ControllerState) {
        self.state = state;
        self.ctx.events.state_changed(NAME, state);
    }

    pub async fn start(
        &mut self,
        server: &ServerDescriptor,
        mode: &ModeDescriptor,
    ) -> Result<(), ControlError> {
        if self.state.is_active() {
            return Err(ControlError::AlreadyRunning);
        }
        self.set_state(ControllerState::Starting);

        match self.launch(server, mode).await {
            Ok(process) => {
                self.process = Some(process);
                self.set_state(ControllerState::Started);
                info!("Rule mode started for {}", mode);
                Ok(())
            }
            Err(e) => {
                self.set_state(ControllerState::Stopped);
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        server: &ServerDescriptor,
        mode: &ModeDescriptor,
    ) -> Result<ProcessHandle, ControlError> {
        let upstream = if server.family.has_local_relay() {
            let settings = &self.ctx.settings;
            let relay = RelayTarget::local(settings, settings.socks5_local_port);
            Upstream {
                host: relay.host,
                port: relay.port,
                credentials: None,
            }
        } else {
            let address = self.ctx.resolver.resolve(&server.hostname).await?;
            Upstream {
                host: address.to_string(),
                port: server.port,
                credentials: server
                    .credentials()
                    .map(|(user, pass)| (user.to_string(), pass.to_string())),
            }
        };

        let listen = self.ctx.settings.local_endpoint(self.ctx.settings.http_local_port);
        let config = render_config(&listen.to_string(), &upstream, mode);
        let path = self.ctx.work_path(CONFIG_FILE);
        debug!("Privoxy configuration:\n{}", config);

        let target = path.clone();
        offload(move || {
            if let Some(dir) = target.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::write(&target, config)
        })
        .await?;

        self.ctx.events.status(format!("Starting {NAME}"));
        let watcher = ReadinessWatcher::new(MARKERS, self.ctx.poll_policy());
        ProcessHandle::launch(
            NAME,
            &self.ctx.bin_path(EXECUTABLE),
            &format!("\"{}\"", path.display()),
            &self.ctx.events,
            &watcher,
        )
        .await
    }

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

/// SOCKS5 upstream of the HTTP relay
struct Upstream {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
}

fn render_config(listen: &str, upstream: &Upstream, mode: &ModeDescriptor) -> String {
    let mut config = String::new();
    let _ = writeln!(config, "listen-address {listen}");
    let _ = writeln!(config, "toggle 0");
    let _ = writeln!(config, "show-on-task-bar 0");
    let _ = writeln!(config, "activity-animation 0");
    let _ = writeln!(config, "debug 1");

    match &upstream.credentials {
        Some((user, pass)) => {
            let _ = writeln!(
                config,
                "forward-socks5 / {user}:{pass}@{}:{} .",
                upstream.host, upstream.port
            );
        }
        None => {
            let _ = writeln!(config, "forward-socks5 / {}:{} .", upstream.host, upstream.port);
        }
    }

    // Later forward lines take precedence.
    for entry in mode.entries() {
        match entry {
            RuleEntry::Address(pattern) => {
                let _ = writeln!(config, "forward {pattern} .");
            }
            RuleEntry::Process(name) => {
                debug!("Rule mode cannot match process {}, skipped", name);
            }
        }
    }

    config
}
