//! Mode controllers
//!
//! A mode decides how local traffic reaches the relay. Pass-through modes
//! only expose the server's relay listener and have no controller.

mod redirector;
mod rule;

pub use redirector::{Recovery, RedirectorController, RECOVERY_POLICY};
pub use rule::RuleController;

use crate::context::ControlContext;
use crate::driver::DriverLifecycleManager;
use crate::error::ControlError;
use crate::model::{ModeDescriptor, ModeKind, ServerDescriptor};
use crate::port::PortType;
use crate::state::ControllerState;

/// Controller of the session's mode
#[derive(Debug)]
pub enum ModeController {
    Redirector(RedirectorController),
    Rule(RuleController),
}

impl ModeController {
    /// Controller for `kind`, `None` for pass-through
    pub fn for_mode(
        kind: ModeKind,
        ctx: &ControlContext,
        driver: &DriverLifecycleManager,
    ) -> Option<Self> {
        match kind {
            ModeKind::Redirector => Some(ModeController::Redirector(RedirectorController::new(
                ctx.clone(),
                driver.clone(),
            ))),
            ModeKind::Rule => Some(ModeController::Rule(RuleController::new(ctx.clone()))),
            ModeKind::PassThrough => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ModeController::Redirector(c) => c.name(),
            ModeController::Rule(c) => c.name(),
        }
    }

    pub fn state(&self) -> ControllerState {
        match self {
            ModeController::Redirector(c) => c.state(),
            ModeController::Rule(c) => c.state(),
        }
    }

    /// Fixed local port this mode binds, checked before start
    pub fn fixed_port(&self, ctx: &ControlContext) -> Option<(u16, PortType)> {
        match self {
            ModeController::Redirector(_) => None,
            ModeController::Rule(_) => Some((ctx.settings.http_local_port, PortType::Tcp)),
        }
    }

    pub async fn start(
        &mut self,
        server: &ServerDescriptor,
        mode: &ModeDescriptor,
    ) -> Result<(), ControlError> {
        match self {
            ModeController::Redirector(c) => c.start(server, mode).await,
            ModeController::Rule(c) => c.start(server, mode).await,
        }
    }

    pub async fn stop(&mut self) {
        match self {
            ModeController::Redirector(c) => c.stop().await,
            ModeController::Rule(c) => c.stop().await,
        }
    }
}
