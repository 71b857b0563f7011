//! Control plane errors
//!
//! Every component reports failures through [`ControlError`]. The
//! [`MainController`](crate::MainController) is the final boundary: it turns
//! these into user notices and a plain `bool`.

use crate::config::ConfigError;
use crate::port::PortConflict;
use std::io;

/// Errors raised while starting or stopping a session
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("No internet connection: {0}")]
    Connectivity(io::Error),

    #[error("Failed to resolve server hostname {host}")]
    Resolution { host: String },

    #[error(transparent)]
    PortConflict(#[from] PortConflict),

    #[error("Driver installation failed: {0}")]
    DriverInstall(String),

    #[error("Service control failed: {0}")]
    ServiceControl(String),

    #[error("{name} did not report readiness in time")]
    ReadinessTimeout { name: String },

    #[error("{name} failed to start: {reason}")]
    BackendFailed { name: String, reason: String },

    #[error("UDP sidecar failed to start: {0}")]
    SidecarStart(#[source] Box<ControlError>),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{server} server cannot be used with {mode} mode")]
    Incompatible { server: String, mode: String },

    #[error("A session is already running")]
    AlreadyRunning,

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl ControlError {
    /// Whether the redirector retry policy should try again
    ///
    /// Only readiness outcomes are retried: timeouts, failure markers and
    /// early exits. Everything else propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ControlError::ReadinessTimeout { .. } | ControlError::BackendFailed { .. }
        )
    }

    /// Whether the failure points at a missing executable or runtime component
    pub fn is_missing_runtime(&self) -> bool {
        match self {
            ControlError::Spawn { source, .. } => source.kind() == io::ErrorKind::NotFound,
            ControlError::SidecarStart(inner) => inner.is_missing_runtime(),
            _ => false,
        }
    }

    pub(crate) fn backend_failed(name: &str, reason: impl Into<String>) -> Self {
        ControlError::BackendFailed {
            name: name.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ControlError::ReadinessTimeout { name: "x".into() }.is_retryable());
        assert!(ControlError::backend_failed("x", "Unable to bind").is_retryable());
        let sidecar = ControlError::SidecarStart(Box::new(ControlError::ReadinessTimeout {
            name: "ShadowsocksUdp".into(),
        }));
        assert!(!sidecar.is_retryable());
        assert!(!ControlError::Resolution { host: "a".into() }.is_retryable());
    }

    #[test]
    fn test_missing_runtime() {
        let missing = ControlError::Spawn {
            program: "Redirector.exe".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert!(missing.is_missing_runtime());
        assert!(ControlError::SidecarStart(Box::new(missing)).is_missing_runtime());

        let denied = ControlError::Spawn {
            program: "Redirector.exe".into(),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!denied.is_missing_runtime());
    }
}
