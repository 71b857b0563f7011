//! OS seams
//!
//! Everything the control plane needs from the operating system goes through
//! the traits in this module: service control, driver registration, DNS
//! configuration, firewall rules, routing probes and reserved port ranges.
//! All of them are blocking; callers run them through [`offload`].
//!
//! [`Platform::system`] wires up [`SystemPlatform`], which drives the stock
//! command-line tools.

mod system;

#[cfg(test)]
pub(crate) mod testing;

pub use system::SystemPlatform;

use crate::port::Transport;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// State of a system service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Running,
    Stopped,
    StartPending,
    StopPending,
    /// The service is not registered
    Missing,
    Other,
}

/// Query, stop and start a named system service
pub trait ServiceControl: Send + Sync {
    fn status(&self, service: &str) -> io::Result<ServiceStatus>;

    /// Request a stop and block until the service reports `Stopped`
    fn stop_and_wait(&self, service: &str, timeout: Duration) -> io::Result<()>;

    fn start(&self, service: &str) -> io::Result<()>;
}

/// Register kernel drivers with the OS driver management subsystem
pub trait DriverRegistry: Send + Sync {
    fn register(&self, service: &str, driver_path: &Path) -> io::Result<()>;

    fn unregister(&self, service: &str) -> io::Result<()>;
}

/// Host facts
pub trait HostInfo: Send + Sync {
    /// OS `(major, minor)` version
    fn os_version(&self) -> Option<(u32, u32)>;

    /// File version metadata, `None` when the file or the metadata is absent
    fn file_version(&self, path: &Path) -> Option<String>;
}

/// DNS servers of the active network adapter
pub trait DnsConfigurator: Send + Sync {
    fn current_servers(&self) -> io::Result<Vec<String>>;

    /// Apply a server list; an empty list resets the adapter to automatic
    fn set_servers(&self, servers: &[String]) -> io::Result<()>;
}

/// Firewall allow rules
pub trait Firewall: Send + Sync {
    fn allow_programs(&self, rule_name: &str, programs: &[PathBuf]) -> io::Result<()>;
}

/// Routing and resolver cache
pub trait NetworkProbe: Send + Sync {
    fn flush_resolver_cache(&self) -> io::Result<()>;

    /// Local endpoint the OS would use to reach `target`
    ///
    /// Fails when there is no route.
    fn route_to(&self, target: SocketAddr) -> io::Result<SocketAddr>;
}

/// Port ranges the OS keeps for itself
pub trait ReservedPorts: Send + Sync {
    fn reserved_ranges(&self, transport: Transport) -> io::Result<Vec<RangeInclusive<u16>>>;
}

/// Bundle of OS seams handed to every controller
#[derive(Clone)]
pub struct Platform {
    pub services: Arc<dyn ServiceControl>,
    pub drivers: Arc<dyn DriverRegistry>,
    pub host: Arc<dyn HostInfo>,
    pub dns: Arc<dyn DnsConfigurator>,
    pub firewall: Arc<dyn Firewall>,
    pub network: Arc<dyn NetworkProbe>,
    pub ports: Arc<dyn ReservedPorts>,
}

impl Platform {
    /// The real operating system
    pub fn system() -> Self {
        let system = Arc::new(SystemPlatform::new());

        Self {
            services: system.clone(),
            drivers: system.clone(),
            host: system.clone(),
            dns: system.clone(),
            firewall: system.clone(),
            network: system.clone(),
            ports: system,
        }
    }
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform").finish_non_exhaustive()
    }
}

/// Run a blocking OS call on the blocking thread pool
pub(crate) async fn offload<F, T>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_offload_returns_value() {
        let value = offload(|| Ok(21 * 2)).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_offload_propagates_error() {
        let result: io::Result<()> =
            offload(|| Err(io::Error::new(io::ErrorKind::TimedOut, "slow"))).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }
}
