//! Session orchestration
//!
//! [`MainController`] owns at most one session: a relay server controller,
//! a mode controller, or both. Starting runs the preflight sequence and
//! rolls the whole session back on any failure, so callers only ever see a
//! running session or nothing at all.

use crate::config::Settings;
use crate::context::ControlContext;
use crate::driver::{DriverImage, DriverLifecycleManager};
use crate::error::ControlError;
use crate::event::{EventBus, Notice};
use crate::mode::ModeController;
use crate::model::{ModeDescriptor, ServerDescriptor};
use crate::nat::{NatReport, NatTester};
use crate::platform::{offload, Platform};
use crate::port::PortType;
use crate::server::ServerController;
use crate::state::ControllerState;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Firewall rule name covering every managed executable
const FIREWALL_RULE: &str = "Sluice";

/// Port name shown in notices about the SOCKS5 local port
const SOCKS5_PORT_NAME: &str = "Socks5";

/// Controllers of the running session
#[derive(Debug, Default)]
pub struct Session {
    server: Option<ServerController>,
    mode: Option<ModeController>,
}

impl Session {
    pub fn is_active(&self) -> bool {
        self.server.is_some() || self.mode.is_some()
    }

    pub fn server(&self) -> Option<&ServerController> {
        self.server.as_ref()
    }

    pub fn mode(&self) -> Option<&ModeController> {
        self.mode.as_ref()
    }
}

/// Entry point of the control plane
#[derive(Debug)]
pub struct MainController {
    ctx: ControlContext,
    driver: DriverLifecycleManager,
    nat: Arc<NatTester>,
    session: Session,
}

impl MainController {
    pub fn new(settings: Settings, platform: Platform, events: EventBus) -> Self {
        let image = match platform.host.os_version() {
            Some((major, minor)) => {
                let image = DriverImage::select(major, minor);
                if image.is_none() {
                    error!(
                        "No redirection driver for OS version {}.{}, redirector mode unavailable",
                        major, minor
                    );
                }
                image
            }
            None => {
                error!("Unable to determine the OS version, redirector mode unavailable");
                None
            }
        };

        let ctx = ControlContext::new(settings, platform, events);
        let driver = DriverLifecycleManager::new(
            ctx.platform.clone(),
            ctx.settings.driver.service_name.clone(),
            ctx.settings.driver.installed_path.clone(),
            image.map(|image| ctx.bin_path(image.file_name())),
        );
        let nat = Arc::new(NatTester::new(ctx.clone()));

        Self {
            ctx,
            driver,
            nat,
            session: Session::default(),
        }
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub fn driver(&self) -> &DriverLifecycleManager {
        &self.driver
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_running(&self) -> bool {
        self.session.is_active()
    }

    pub fn server_state(&self) -> Option<ControllerState> {
        self.session.server.as_ref().map(ServerController::state)
    }

    pub fn mode_state(&self) -> Option<ControllerState> {
        self.session.mode.as_ref().map(ModeController::state)
    }

    /// Start a session, returning whether it is running
    ///
    /// Failures are published as notices and leave nothing running.
    pub async fn start(&mut self, server: &ServerDescriptor, mode: &ModeDescriptor) -> bool {
        info!("Starting {} with {}", server, mode);

        match self.try_start(server, mode).await {
            Ok(()) => {
                self.ctx.events.status("Started");
                true
            }
            Err(e) => {
                self.report(&e);
                false
            }
        }
    }

    async fn try_start(
        &mut self,
        server: &ServerDescriptor,
        mode: &ModeDescriptor,
    ) -> Result<(), ControlError> {
        if self.session.is_active() {
            return Err(ControlError::AlreadyRunning);
        }
        if !server.family.has_local_relay() && mode.kind.exposes_local_relay_only() {
            return Err(ControlError::Incompatible {
                server: server.family.to_string(),
                mode: mode.kind.to_string(),
            });
        }

        self.check_connectivity().await?;

        let working = if self.ctx.settings.resolve_server_hostname {
            self.ctx.events.status("Resolving server hostname");
            let address = self.ctx.resolver.resolve(&server.hostname).await?;
            server.with_hostname(address.to_string())
        } else {
            server.clone()
        };

        self.allow_through_firewall();

        if let Err(e) = self.launch(server, &working, mode).await {
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }

    async fn check_connectivity(&self) -> Result<(), ControlError> {
        self.ctx.events.status("Checking network");

        let network = self.ctx.platform.network.clone();
        let probe = self.ctx.settings.connectivity_probe;
        let local = offload(move || {
            if let Err(e) = network.flush_resolver_cache() {
                warn!("Failed to flush the resolver cache: {}", e);
            }
            network.route_to(probe)
        })
        .await
        .map_err(ControlError::Connectivity)?;

        self.ctx.resolver.clear_cache();
        info!("Route to {} via {}", probe, local);
        Ok(())
    }

    /// Fire and forget: a missing rule never blocks the session
    fn allow_through_firewall(&self) {
        let firewall = self.ctx.platform.firewall.clone();
        let programs = self.ctx.settings.managed_paths();

        tokio::spawn(async move {
            if let Err(e) = offload(move || firewall.allow_programs(FIREWALL_RULE, &programs)).await
            {
                warn!("Failed to add firewall rules: {}", e);
            }
        });
    }

    /// Relay backends get the working copy; the mode gets the configured
    /// entry so it can match it against the UDP server selection.
    async fn launch(
        &mut self,
        server: &ServerDescriptor,
        working: &ServerDescriptor,
        mode: &ModeDescriptor,
    ) -> Result<(), ControlError> {
        if let Some(controller) = ServerController::primary(self.ctx.clone(), server.family) {
            controller.kill_stale_instances().await;
            self.ctx
                .preflight()
                .check(controller.port(), SOCKS5_PORT_NAME, PortType::Both)
                .await?;

            let controller = self.session.server.insert(controller);
            controller.start(working).await?;
        }

        if let Some(controller) = ModeController::for_mode(mode.kind, &self.ctx, &self.driver) {
            if let Some((port, kind)) = controller.fixed_port(&self.ctx) {
                self.ctx
                    .preflight()
                    .check(port, controller.name(), kind)
                    .await?;
            }

            self.ctx.events.status(format!("Starting {}", controller.name()));
            let controller = self.session.mode.insert(controller);
            controller.start(server, mode).await?;
        }

        Ok(())
    }

    fn report(&self, e: &ControlError) {
        let notice = notice_for(e);
        match &notice {
            Notice::StartFailed { .. } => error!("Start failed: {:?}", e),
            _ => warn!("Start failed: {}", e),
        }
        self.ctx.events.notice(notice);
    }

    /// Tear down the session; safe to call at any time
    pub async fn stop(&mut self) {
        let Session { server, mode } = &mut self.session;

        tokio::join!(
            self.nat.stop(),
            async {
                if let Some(server) = server.as_mut() {
                    server.stop().await;
                }
            },
            async {
                if let Some(mode) = mode.as_mut() {
                    mode.stop().await;
                }
            },
        );

        self.session = Session::default();
        self.ctx.events.status("Stopped");
    }

    /// Probe the NAT type through the local relay
    pub async fn test_nat(&self) -> Result<NatReport, ControlError> {
        self.ctx.events.status("Testing NAT type");
        self.nat.run().await
    }
}

fn notice_for(e: &ControlError) -> Notice {
    match e {
        ControlError::Connectivity(_) => Notice::NoConnectivity,
        ControlError::Resolution { host } => Notice::ResolutionFailed { host: host.clone() },
        ControlError::PortConflict(conflict) => Notice::from(conflict),
        e if e.is_missing_runtime() => Notice::MissingRuntime {
            detail: e.to_string(),
        },
        ControlError::SidecarStart(inner) => match notice_for(inner) {
            Notice::StartFailed { .. } => Notice::StartFailed {
                detail: e.to_string(),
            },
            notice => notice,
        },
        e => Notice::StartFailed {
            detail: e.to_string(),
        },
    }
}
