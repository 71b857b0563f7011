//! Redirection driver lifecycle
//!
//! The redirector needs a kernel driver hosted by a system service. The
//! bundled image depends on the OS version; the installed copy is replaced
//! whenever its file version differs from the bundled one.

use crate::error::ControlError;
use crate::platform::{offload, Platform, ServiceStatus};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info, warn};

/// Upper bound for the hosting service to reach `Stopped`
const SERVICE_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Bundled driver image for an OS generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverImage {
    Win10,
    Win8,
    Win7,
}

impl DriverImage {
    /// Pick the image for an OS `(major, minor)` version
    pub fn select(major: u32, minor: u32) -> Option<Self> {
        match (major, minor) {
            (10, 0) => Some(DriverImage::Win10),
            (6, 2) | (6, 3) => Some(DriverImage::Win8),
            (6, 0) | (6, 1) => Some(DriverImage::Win7),
            _ => None,
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            DriverImage::Win10 => "Win-10.sys",
            DriverImage::Win8 => "Win-8.sys",
            DriverImage::Win7 => "Win-7.sys",
        }
    }
}

impl fmt::Display for DriverImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.file_name())
    }
}

/// Installs, removes and version-checks the redirection driver
#[derive(Debug, Clone)]
pub struct DriverLifecycleManager {
    platform: Platform,
    service: String,
    installed: PathBuf,
    bundled: Option<PathBuf>,
}

impl DriverLifecycleManager {
    /// `bundled` is `None` on OS versions without a driver image
    pub fn new(
        platform: Platform,
        service: impl Into<String>,
        installed: PathBuf,
        bundled: Option<PathBuf>,
    ) -> Self {
        Self {
            platform,
            service: service.into(),
            installed,
            bundled,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service
    }

    pub fn installed_path(&self) -> &Path {
        &self.installed
    }

    fn bundled(&self) -> Result<&Path, ControlError> {
        self.bundled.as_deref().ok_or_else(|| {
            ControlError::UnsupportedPlatform("no redirection driver for this OS version".into())
        })
    }

    /// File version of a driver image, empty when absent
    pub async fn version(&self, path: &Path) -> String {
        let host = self.platform.host.clone();
        let path = path.to_path_buf();

        offload(move || Ok(host.file_version(&path)))
            .await
            .ok()
            .flatten()
            .unwrap_or_default()
    }

    pub async fn service_status(&self) -> Result<ServiceStatus, ControlError> {
        let services = self.platform.services.clone();
        let service = self.service.clone();

        offload(move || services.status(&service))
            .await
            .map_err(|e| ControlError::ServiceControl(e.to_string()))
    }

    /// Register the installed image with the OS
    pub async fn register(&self) -> Result<(), ControlError> {
        let drivers = self.platform.drivers.clone();
        let service = self.service.clone();
        let installed = self.installed.clone();

        offload(move || drivers.register(&service, &installed))
            .await
            .map_err(|e| {
                error!("Driver registration failed: {}", e);
                ControlError::DriverInstall(format!("registration failed: {e}"))
            })?;

        info!("Driver registered as {}", self.service);
        Ok(())
    }

    /// Copy the bundled image into place and register it
    pub async fn install(&self) -> Result<(), ControlError> {
        let bundled = self.bundled()?.to_path_buf();
        let installed = self.installed.clone();
        info!("Installing driver {} to {}", bundled.display(), installed.display());

        offload(move || std::fs::copy(&bundled, &installed).map(drop))
            .await
            .map_err(|e| {
                error!("Driver copy failed: {}", e);
                ControlError::DriverInstall(format!("copy failed: {e}"))
            })?;

        self.register().await
    }

    /// Stop the hosting service, unregister and delete the installed image
    ///
    /// A missing installed image counts as already uninstalled.
    /// Failing to stop the service is logged and the removal goes on.
    pub async fn uninstall(&self) -> Result<(), ControlError> {
        if let Err(e) = self.stop_service().await {
            warn!("Stopping {} before uninstall failed: {}", self.service, e);
        }

        if !self.installed.exists() {
            info!("Driver not installed, nothing to remove");
            return Ok(());
        }

        let drivers = self.platform.drivers.clone();
        let service = self.service.clone();
        let installed = self.installed.clone();
        offload(move || {
            drivers.unregister(&service)?;
            std::fs::remove_file(&installed)
        })
        .await
        .map_err(|e| ControlError::DriverInstall(format!("uninstall failed: {e}")))?;

        info!("Driver uninstalled");
        Ok(())
    }

    async fn stop_service(&self) -> Result<(), ControlError> {
        if self.service_status().await? != ServiceStatus::Running {
            return Ok(());
        }

        let services = self.platform.services.clone();
        let service = self.service.clone();
        offload(move || services.stop_and_wait(&service, SERVICE_STOP_TIMEOUT))
            .await
            .map_err(|e| ControlError::ServiceControl(e.to_string()))
    }

    /// Make the installed image match the bundled one
    pub async fn ensure_current(&self) -> Result<(), ControlError> {
        let bundled = self.bundled()?;
        if !bundled.exists() {
            return Err(ControlError::DriverInstall(format!(
                "bundled driver {} is missing",
                bundled.display()
            )));
        }

        let bundled_version = self.version(bundled).await;
        info!("Bundled driver version: {}", bundled_version);

        if self.installed.exists() {
            let installed_version = self.version(&self.installed).await;
            if installed_version == bundled_version {
                return Ok(());
            }

            info!(
                "Installed driver version {} differs, updating",
                installed_version
            );
            self.uninstall().await?;
        }

        self.install().await
    }

    /// Bounce the hosting service
    ///
    /// A running service is stopped and started again, a stopped one just
    /// started. When service control fails or the service is not registered
    /// the driver is registered again instead.
    pub async fn restart_service(&self) -> Result<(), ControlError> {
        let services = self.platform.services.clone();
        let service = self.service.clone();

        let restarted = offload(move || {
            match services.status(&service)? {
                ServiceStatus::Running => {
                    services.stop_and_wait(&service, SERVICE_STOP_TIMEOUT)?;
                    services.start(&service)
                }
                ServiceStatus::Stopped => services.start(&service),
                ServiceStatus::Missing => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("service {service} is not registered"),
                )),
                _ => Ok(()),
            }
        })
        .await;

        match restarted {
            Ok(()) => {
                info!("Driver service {} restarted", self.service);
                Ok(())
            }
            Err(e) => {
                warn!("Restarting {} failed ({}), registering driver again", self.service, e);
                self.register().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::{FakePlatform, TempDir};
    use std::sync::atomic::Ordering;

    fn manager(fake: &FakePlatform, dir: &TempDir) -> DriverLifecycleManager {
        DriverLifecycleManager::new(
            fake.platform(),
            "netfilter2",
            dir.join("installed.sys"),
            Some(dir.join("Win-10.sys")),
        )
    }

    #[test]
    fn test_image_selection() {
        assert_eq!(DriverImage::select(10, 0), Some(DriverImage::Win10));
        assert_eq!(DriverImage::select(6, 3), Some(DriverImage::Win8));
        assert_eq!(DriverImage::select(6, 2), Some(DriverImage::Win8));
        assert_eq!(DriverImage::select(6, 1).unwrap().file_name(), "Win-7.sys");
        assert_eq!(DriverImage::select(6, 0), Some(DriverImage::Win7));
        assert_eq!(DriverImage::select(5, 1), None);
    }

    #[tokio::test]
    async fn test_version_of_missing_file_is_empty() {
        let fake = FakePlatform::new();
        let dir = TempDir::new("driver-version");

        assert_eq!(manager(&fake, &dir).version(&dir.join("nope.sys")).await, "");
    }

    #[tokio::test]
    async fn test_current_driver_untouched() {
        let fake = FakePlatform::new();
        let dir = TempDir::new("driver-current");
        std::fs::write(dir.join("Win-10.sys"), "2.0").unwrap();
        std::fs::write(dir.join("installed.sys"), "2.0").unwrap();

        manager(&fake, &dir).ensure_current().await.unwrap();

        assert!(fake.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_version_mismatch_reinstalls() {
        let fake = FakePlatform::new();
        let dir = TempDir::new("driver-mismatch");
        std::fs::write(dir.join("Win-10.sys"), "2.0").unwrap();
        std::fs::write(dir.join("installed.sys"), "1.0").unwrap();

        manager(&fake, &dir).ensure_current().await.unwrap();

        assert_eq!(
            fake.journal.entries(),
            vec!["service.stop", "driver.unregister", "driver.register"]
        );
        assert_eq!(std::fs::read_to_string(dir.join("installed.sys")).unwrap(), "2.0");
    }

    #[tokio::test]
    async fn test_fresh_install() {
        let fake = FakePlatform::new();
        let dir = TempDir::new("driver-fresh");
        std::fs::write(dir.join("Win-10.sys"), "2.0").unwrap();

        manager(&fake, &dir).ensure_current().await.unwrap();

        assert_eq!(fake.journal.entries(), vec!["driver.register"]);
        assert!(dir.join("installed.sys").exists());
    }

    #[tokio::test]
    async fn test_missing_bundled_driver() {
        let fake = FakePlatform::new();
        let dir = TempDir::new("driver-missing");

        let err = manager(&fake, &dir).ensure_current().await.unwrap_err();
        assert!(matches!(err, ControlError::DriverInstall(_)));
    }

    #[tokio::test]
    async fn test_uninstall_missing_is_success() {
        let fake = FakePlatform::new();
        *fake.services.status.lock().unwrap() = ServiceStatus::Stopped;
        let dir = TempDir::new("driver-uninstall");

        manager(&fake, &dir).uninstall().await.unwrap();
        assert!(fake.journal.entries().is_empty());
    }

    #[tokio::test]
    async fn test_registration_failure() {
        let fake = FakePlatform::new();
        fake.drivers.fail_register.store(true, Ordering::SeqCst);
        let dir = TempDir::new("driver-register");
        std::fs::write(dir.join("Win-10.sys"), "2.0").unwrap();

        let err = manager(&fake, &dir).install().await.unwrap_err();
        assert!(matches!(err, ControlError::DriverInstall(_)));
    }

    #[tokio::test]
    async fn test_restart_service() {
        let fake = FakePlatform::new();
        let dir = TempDir::new("driver-restart");

        manager(&fake, &dir).restart_service().await.unwrap();
        assert_eq!(fake.journal.entries(), vec!["service.stop", "service.start"]);
    }

    #[tokio::test]
    async fn test_restart_falls_back_to_register() {
        let fake = FakePlatform::new();
        *fake.services.status.lock().unwrap() = ServiceStatus::Stopped;
        fake.services.fail_start.store(true, Ordering::SeqCst);
        let dir = TempDir::new("driver-fallback");

        manager(&fake, &dir).restart_service().await.unwrap();
        assert_eq!(
            fake.journal.entries(),
            vec!["service.start.failed", "driver.register"]
        );
    }

    #[tokio::test]
    async fn test_restart_unregistered_service_registers() {
        let fake = FakePlatform::new();
        *fake.services.status.lock().unwrap() = ServiceStatus::Missing;
        let dir = TempDir::new("driver-missing-service");

        manager(&fake, &dir).restart_service().await.unwrap();
        assert_eq!(fake.journal.entries(), vec!["driver.register"]);
    }

    #[tokio::test]
    async fn test_uninstall_continues_when_status_fails() {
        let fake = FakePlatform::new();
        fake.services.fail_status.store(true, Ordering::SeqCst);
        let dir = TempDir::new("driver-uninstall-status");
        std::fs::write(dir.join("installed.sys"), "1.0").unwrap();

        manager(&fake, &dir).uninstall().await.unwrap();

        assert_eq!(fake.journal.entries(), vec!["driver.unregister"]);
        assert!(!dir.join("installed.sys").exists());
    }

    #[tokio::test]
    async fn test_unsupported_os() {
        let fake = FakePlatform::new();
        let dir = TempDir::new("driver-unsupported");
        let manager =
            DriverLifecycleManager::new(fake.platform(), "netfilter2", dir.join("x.sys"), None);

        assert!(matches!(
            manager.ensure_current().await,
            Err(ControlError::UnsupportedPlatform(_))
        ));
    }
}
