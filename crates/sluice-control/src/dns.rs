//! System DNS override
//!
//! While the redirector runs, system DNS can be pointed at fixed public
//! servers. The previous configuration is kept in a [`DnsSnapshot`] that can
//! only be restored once.

use crate::error::ControlError;
use crate::platform::{offload, DnsConfigurator};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// DNS servers captured before an override
///
/// Not `Clone`: restoring consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct DnsSnapshot {
    servers: Vec<String>,
}

impl DnsSnapshot {
    pub fn servers(&self) -> &[String] {
        &self.servers
    }
}

/// Applies and reverts DNS overrides
#[derive(Clone)]
pub struct DnsOverrideManager {
    dns: Arc<dyn DnsConfigurator>,
}

impl fmt::Debug for DnsOverrideManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DnsOverrideManager").finish_non_exhaustive()
    }
}

impl DnsOverrideManager {
    pub fn new(dns: Arc<dyn DnsConfigurator>) -> Self {
        Self { dns }
    }

    /// Capture the current servers, then apply `servers`
    pub async fn override_dns(&self, servers: &[String]) -> Result<DnsSnapshot, ControlError> {
        let dns = self.dns.clone();
        let replacement = servers.to_vec();

        let previous = offload(move || {
            let previous = dns.current_servers()?;
            dns.set_servers(&replacement)?;
            Ok(previous)
        })
        .await?;

        info!("System DNS {:?} replaced by {:?}", previous, servers);
        Ok(DnsSnapshot { servers: previous })
    }

    /// Re-apply the captured servers
    pub async fn restore(&self, snapshot: DnsSnapshot) -> Result<(), ControlError> {
        let dns = self.dns.clone();
        let servers = snapshot.servers;

        let applied = servers.clone();
        offload(move || dns.set_servers(&applied)).await?;

        info!("System DNS restored to {:?}", servers);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::FakePlatform;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_manager_debug() {
        let manager = DnsOverrideManager::new(FakePlatform::new().platform().dns);
        assert_eq!(format!("{manager:?}"), "DnsOverrideManager { .. }");
    }

    #[tokio::test]
    async fn test_override_and_restore() {
        let fake = FakePlatform::new();
        let manager = DnsOverrideManager::new(fake.dns.clone());
        let original = fake.dns.servers.lock().unwrap().clone();

        let snapshot = manager
            .override_dns(&["1.1.1.1".to_string(), "8.8.8.8".to_string()])
            .await
            .unwrap();
        assert_eq!(snapshot.servers(), original.as_slice());
        assert_eq!(*fake.dns.servers.lock().unwrap(), vec!["1.1.1.1", "8.8.8.8"]);

        manager.restore(snapshot).await.unwrap();
        assert_eq!(*fake.dns.servers.lock().unwrap(), original);
        assert_eq!(fake.journal.count("dns.set"), 2);
    }

    #[tokio::test]
    async fn test_failed_override_yields_no_snapshot() {
        let fake = FakePlatform::new();
        fake.dns.fail_set.store(true, Ordering::SeqCst);
        let manager = DnsOverrideManager::new(fake.dns.clone());

        assert!(manager.override_dns(&["1.1.1.1".to_string()]).await.is_err());
        assert_eq!(fake.journal.count("dns.set"), 0);
    }
}
