//! Controller lifecycle state

use std::fmt;

/// Lifecycle of a server or mode controller
///
/// `Stopped -> Starting -> Started -> Stopping -> Stopped`. A failed start
/// goes straight from `Starting` back to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl ControllerState {
    /// Anything but `Stopped`
    pub fn is_active(&self) -> bool {
        !matches!(self, ControllerState::Stopped)
    }

    /// Check if the controller finished starting
    pub fn is_started(&self) -> bool {
        matches!(self, ControllerState::Started)
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ControllerState::Stopped => "stopped",
            ControllerState::Starting => "starting",
            ControllerState::Started => "started",
            ControllerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_controller_state() {
        assert_eq!(ControllerState::default(), ControllerState::Stopped);
        assert!(!ControllerState::Stopped.is_active());
        assert!(ControllerState::Starting.is_active());
        assert!(ControllerState::Started.is_started());
        assert!(!ControllerState::Stopping.is_started());
    }
}
