//! UDP sidecar
//!
//! A dedicated UDP server gets its own relay process next to the primary,
//! listening one port above the SOCKS5 local port. A SOCKS5 dedicated
//! server needs no process and is addressed directly.

use crate::args::{RelayTarget, UdpRoute};
use crate::context::ControlContext;
use crate::error::ControlError;
use crate::model::ServerDescriptor;
use crate::port::{PortConflict, PortType};
use crate::server::ServerController;
use tracing::{info, warn};

/// Starts and stops the optional UDP relay
#[derive(Debug)]
pub struct SidecarOrchestrator {
    ctx: ControlContext,
    controller: Option<ServerController>,
}

impl SidecarOrchestrator {
    pub fn new(ctx: ControlContext) -> Self {
        Self {
            ctx,
            controller: None,
        }
    }

    /// Whether `dedicated` needs a relay process of its own
    pub fn needs_process(dedicated: &ServerDescriptor) -> bool {
        dedicated.family.has_local_relay()
    }

    /// Sidecar listen port
    pub fn port(&self) -> Result<u16, ControlError> {
        let primary = self.ctx.settings.socks5_local_port;
        primary.checked_add(1).ok_or_else(|| {
            ControlError::from(PortConflict::Reserved {
                name: "UDP relay".to_string(),
                port: primary,
            })
        })
    }

    pub fn is_running(&self) -> bool {
        self.controller.is_some()
    }

    pub fn pid(&self) -> Option<u32> {
        self.controller.as_ref().and_then(ServerController::pid)
    }

    /// UDP target for `route`, starting the sidecar when one is needed
    pub async fn prepare(
        &mut self,
        route: &UdpRoute,
        tcp: &RelayTarget,
    ) -> Result<RelayTarget, ControlError> {
        match route {
            UdpRoute::SameAsTcp => Ok(tcp.clone()),
            UdpRoute::PrimaryRelay => Ok(RelayTarget::local(
                &self.ctx.settings,
                self.ctx.settings.socks5_local_port,
            )),
            UdpRoute::Dedicated(dedicated) => self
                .start(dedicated)
                .await
                .map_err(|e| ControlError::SidecarStart(Box::new(e))),
        }
    }

    async fn start(&mut self, dedicated: &ServerDescriptor) -> Result<RelayTarget, ControlError> {
        let address = self.ctx.resolver.resolve(&dedicated.hostname).await?;
        let working = dedicated.with_hostname(address.to_string());

        if !Self::needs_process(dedicated) {
            info!("UDP relays directly to {}", working);
            return Ok(RelayTarget::new(working.hostname, working.port));
        }

        let port = self.port()?;
        self.ctx
            .preflight()
            .check(port, "UDP relay", PortType::Both)
            .await?;

        let mut controller = ServerController::sidecar(self.ctx.clone(), dedicated.family, port)
            .ok_or_else(|| ControlError::backend_failed("UDP relay", "no local relay backend"))?;
        controller.start(&working).await?;

        info!("{} relaying UDP for {} on port {}", controller.name(), dedicated, port);
        self.controller = Some(controller);
        Ok(RelayTarget::local(&self.ctx.settings, port))
    }

    /// Stop the sidecar if one runs
    pub async fn stop(&mut self) {
        if let Some(mut controller) = self.controller.take() {
            controller.stop().await;
            if controller.state().is_active() {
                warn!("{} did not stop cleanly", controller.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventBus;
    use crate::model::ProtocolFamily;
    use crate::platform::testing::{fast_settings, FakePlatform, TempDir};

    fn context(dir: &TempDir) -> ControlContext {
        ControlContext::new(
            fast_settings(dir),
            FakePlatform::new().platform(),
            EventBus::default(),
        )
    }

    #[test]
    fn test_needs_process() {
        let socks = ServerDescriptor::new(ProtocolFamily::Socks5, "1.1.1.1", 1080);
        let trojan = ServerDescriptor::new(ProtocolFamily::Trojan, "1.1.1.1", 443);

        assert!(!SidecarOrchestrator::needs_process(&socks));
        assert!(SidecarOrchestrator::needs_process(&trojan));
    }

    #[tokio::test]
    async fn test_routes_without_process() {
        let dir = TempDir::new("sidecar-routes");
        let mut sidecar = SidecarOrchestrator::new(context(&dir));
        let tcp = RelayTarget::new("5.6.7.8", 1080);

        assert_eq!(sidecar.prepare(&UdpRoute::SameAsTcp, &tcp).await.unwrap(), tcp);
        assert_eq!(
            sidecar.prepare(&UdpRoute::PrimaryRelay, &tcp).await.unwrap(),
            RelayTarget::new("127.0.0.1", 2801)
        );

        let socks = ServerDescriptor::new(ProtocolFamily::Socks5, "9.8.7.6", 1081);
        assert_eq!(
            sidecar.prepare(&UdpRoute::Dedicated(socks), &tcp).await.unwrap(),
            RelayTarget::new("9.8.7.6", 1081)
        );
        assert!(!sidecar.is_running());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sidecar_lifecycle() {
        use crate::platform::testing::{ready_after, write_script};

        let dir = TempDir::new("sidecar-start");
        write_script(dir.path(), "Trojan.exe", &ready_after("started"));
        let mut sidecar = SidecarOrchestrator::new(context(&dir));

        let trojan = ServerDescriptor::new(ProtocolFamily::Trojan, "9.9.9.9", 443);
        let target = sidecar
            .prepare(&UdpRoute::Dedicated(trojan), &RelayTarget::new("x", 1))
            .await
            .unwrap();

        assert_eq!(target, RelayTarget::new("127.0.0.1", 2802));
        assert!(sidecar.pid().is_some());
        assert!(dir.join("data").join("trojanudp.json").exists());

        sidecar.stop().await;
        assert!(!sidecar.is_running());
    }

    #[tokio::test]
    async fn test_start_failure_is_wrapped() {
        let dir = TempDir::new("sidecar-missing");
        let mut sidecar = SidecarOrchestrator::new(context(&dir));

        let trojan = ServerDescriptor::new(ProtocolFamily::Trojan, "9.9.9.9", 443);
        let err = sidecar
            .prepare(&UdpRoute::Dedicated(trojan), &RelayTarget::new("x", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, ControlError::SidecarStart(_)));
        assert!(err.is_missing_runtime());
        assert!(!sidecar.is_running());
    }
}
