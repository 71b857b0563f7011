//! Process redirector mode
//!
//! Drives `Redirector.exe`, which uses the kernel driver to push the TCP and
//! UDP traffic of selected processes into the local relay.
//!
//! # Start sequence
//!
//! 1. Bring the installed driver in line with the bundled image
//! 2. Walk the recovery table; each attempt plans targets, starts the UDP
//!    sidecar if needed, spawns the redirector and waits for readiness
//! 3. Once ready, optionally override system DNS
//!
//! Readiness failures are retried; everything else stops the mode and
//! propagates.

use crate::args::{plan_udp_route, RedirectorArgs, RelayTarget};
use crate::context::ControlContext;
use crate::dns::{DnsOverrideManager, DnsSnapshot};
use crate::driver::DriverLifecycleManager;
use crate::error::ControlError;
use crate::model::{ModeDescriptor, ServerDescriptor};
use crate::process::ProcessHandle;
use crate::readiness::{Markers, ReadinessWatcher};
use crate::sidecar::SidecarOrchestrator;
use crate::state::ControllerState;
use tracing::{debug, info, warn};

const NAME: &str = "Redirector";
const EXECUTABLE: &str = "Redirector.exe";
const MARKERS: Markers = Markers::new(&["Redirect TCP to"], &["Failed to", "Unable to"]);

/// What to do before an attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    None,
    /// Bounce the driver service, re-registering the driver if that fails
    RestartService,
}

/// One entry per attempt
pub const RECOVERY_POLICY: [Recovery; 2] = [Recovery::None, Recovery::RestartService];

/// Redirector mode controller
#[derive(Debug)]
pub struct RedirectorController {
    ctx: ControlContext,
    driver: DriverLifecycleManager,
    dns: DnsOverrideManager,
    sidecar: SidecarOrchestrator,
    state: ControllerState,
    process: Option<ProcessHandle>,
    snapshot: Option<DnsSnapshot>,
}

impl RedirectorController {
    pub fn new(ctx: ControlContext, driver: DriverLifecycleManager) -> Self {
        Self {
            dns: DnsOverrideManager::new(ctx.platform.dns.clone()),
            sidecar: SidecarOrchestrator::new(ctx.clone()),
            ctx,
            driver,
            state: ControllerState::Stopped,
            process: None,
            snapshot: None,
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

    pub fn sidecar(&self) -> &SidecarOrchestrator {
        &self.sidecar
    }

    /// Check if a DNS override is waiting to be restored
    pub fn has_dns_snapshot(&self) -> bool {
        self.snapshot.is_some()
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

        self.ctx.events.status("Checking redirection driver");
        self.driver.ensure_current().await?;

        let mut last_error = None;
        for (attempt, recovery) in RECOVERY_POLICY.iter().enumerate() {
            if *recovery == Recovery::RestartService {
                self.ctx
                    .events
                    .status(format!("Restarting {} service", self.driver.service_name()));
                self.driver.restart_service().await?;
            }

            match self.attempt(server, mode).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() => {
                    warn!("Redirector attempt {} failed: {}", attempt + 1, e);
                    self.stop().await;
                    last_error = Some(e);
                }
                Err(e) => {
                    self.stop().await;
                    return Err(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ControlError::ReadinessTimeout {
            name: NAME.to_string(),
        }))
    }

    async fn attempt(
        &mut self,
        server: &ServerDescriptor,
        mode: &ModeDescriptor,
    ) -> Result<(), ControlError> {
        self.set_state(ControllerState::Starting);
        let settings = self.ctx.settings.clone();

        let working = if server.family.has_local_relay() {
            server.clone()
        } else {
            let address = self.ctx.resolver.resolve(&server.hostname).await?;
            server.with_hostname(address.to_string())
        };

        let tcp = RelayTarget::primary(&settings, &working);
        let route = plan_udp_route(&settings, server);
        let udp = self.sidecar.prepare(&route, &tcp).await?;

        let args = RedirectorArgs::build(&settings, &working, mode, tcp, udp);
        debug!("Redirector arguments: {}", args);

        self.ctx.events.status(format!("Starting {NAME}"));
        let watcher = ReadinessWatcher::new(MARKERS, self.ctx.poll_policy());
        let process = ProcessHandle::launch(
            NAME,
            &self.ctx.bin_path(EXECUTABLE),
            &args.to_string(),
            &self.ctx.events,
            &watcher,
        )
        .await?;
        self.process = Some(process);

        if settings.modify_system_dns {
            self.snapshot = Some(self.dns.override_dns(&settings.override_dns).await?);
        }

        self.set_state(ControllerState::Started);
        info!("Redirector started for {}", mode);
        Ok(())
    }

    /// Restore DNS, kill the redirector and the sidecar
    ///
    /// Never fails; every step is attempted.
    pub async fn stop(&mut self) {
        if self.state.is_started() {
            self.set_state(ControllerState::Stopping);
        }

        if let Some(snapshot) = self.snapshot.take() {
            if let Err(e) = self.dns.restore(snapshot).await {
                warn!("Failed to restore system DNS: {}", e);
            }
        }

        if let Some(mut process) = self.process.take() {
            process.stop().await;
        }

        self.sidecar.stop().await;

        if self.state.is_active() {
            self.set_state(ControllerState::Stopped);
        }
    }
}
