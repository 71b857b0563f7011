//! In-memory platform fakes and fixtures for tests

use super::{
    DnsConfigurator, DriverRegistry, Firewall, HostInfo, NetworkProbe, Platform, ReservedPorts,
    ServiceControl, ServiceStatus,
};
use crate::config::Settings;
use crate::port::Transport;
use std::io;
use std::net::SocketAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Ordered record of platform calls
#[derive(Debug, Clone, Default)]
pub(crate) struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

#[derive(Debug)]
pub(crate) struct FakeServices {
    pub status: Mutex<ServiceStatus>,
    pub fail_status: AtomicBool,
    pub fail_start: AtomicBool,
    journal: Journal,
}

impl ServiceControl for FakeServices {
    fn status(&self, _service: &str) -> io::Result<ServiceStatus> {
        if self.fail_status.load(Ordering::SeqCst) {
            return Err(io::Error::other("service manager unavailable"));
        }
        Ok(*self.status.lock().unwrap())
    }

    fn stop_and_wait(&self, _service: &str, _timeout: Duration) -> io::Result<()> {
        self.journal.record("service.stop");
        *self.status.lock().unwrap() = ServiceStatus::Stopped;
        Ok(())
    }

    fn start(&self, _service: &str) -> io::Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            self.journal.record("service.start.failed");
            return Err(io::Error::other("service refused to start"));
        }
        self.journal.record("service.start");
        *self.status.lock().unwrap() = ServiceStatus::Running;
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeDrivers {
    pub fail_register: AtomicBool,
    journal: Journal,
}

impl DriverRegistry for FakeDrivers {
    fn register(&self, _service: &str, _driver_path: &Path) -> io::Result<()> {
        if self.fail_register.load(Ordering::SeqCst) {
            self.journal.record("driver.register.failed");
            return Err(io::Error::other("registration refused"));
        }
        self.journal.record("driver.register");
        Ok(())
    }

    fn unregister(&self, _service: &str) -> io::Result<()> {
        self.journal.record("driver.unregister");
        Ok(())
    }
}

/// File versions are the trimmed file contents
#[derive(Debug)]
pub(crate) struct FakeHost {
    pub os: Option<(u32, u32)>,
}

impl HostInfo for FakeHost {
    fn os_version(&self) -> Option<(u32, u32)> {
        self.os
    }

    fn file_version(&self, path: &Path) -> Option<String> {
        std::fs::read_to_string(path)
            .ok()
            .map(|content| content.trim().to_string())
    }
}

#[derive(Debug)]
pub(crate) struct FakeDns {
    pub servers: Mutex<Vec<String>>,
    pub fail_set: AtomicBool,
    journal: Journal,
}

impl DnsConfigurator for FakeDns {
    fn current_servers(&self) -> io::Result<Vec<String>> {
        Ok(self.servers.lock().unwrap().clone())
    }

    fn set_servers(&self, servers: &[String]) -> io::Result<()> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(io::Error::other("adapter is read-only"));
        }
        self.journal.record(format!("dns.set:{}", servers.join(",")));
        *self.servers.lock().unwrap() = servers.to_vec();
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeFirewall {
    journal: Journal,
}

impl Firewall for FakeFirewall {
    fn allow_programs(&self, _rule_name: &str, programs: &[PathBuf]) -> io::Result<()> {
        self.journal.record(format!("firewall.allow:{}", programs.len()));
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeNetwork {
    pub online: AtomicBool,
    journal: Journal,
}

impl NetworkProbe for FakeNetwork {
    fn flush_resolver_cache(&self) -> io::Result<()> {
        self.journal.record("network.flush");
        Ok(())
    }

    fn route_to(&self, _target: SocketAddr) -> io::Result<SocketAddr> {
        if self.online.load(Ordering::SeqCst) {
            Ok(SocketAddr::from(([192, 168, 1, 20], 50000)))
        } else {
            Err(io::Error::new(
                io::ErrorKind::NetworkUnreachable,
                "network is unreachable",
            ))
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct FakePorts {
    pub ranges: Mutex<Vec<RangeInclusive<u16>>>,
}

impl FakePorts {
    pub fn with_ranges(ranges: Vec<RangeInclusive<u16>>) -> Self {
        Self {
            ranges: Mutex::new(ranges),
        }
    }
}

impl ReservedPorts for FakePorts {
    fn reserved_ranges(&self, _transport: Transport) -> io::Result<Vec<RangeInclusive<u16>>> {
        Ok(self.ranges.lock().unwrap().clone())
    }
}

/// All fakes sharing one journal
pub(crate) struct FakePlatform {
    pub journal: Journal,
    pub services: Arc<FakeServices>,
    pub drivers: Arc<FakeDrivers>,
    pub host: Arc<FakeHost>,
    pub dns: Arc<FakeDns>,
    pub firewall: Arc<FakeFirewall>,
    pub network: Arc<FakeNetwork>,
    pub ports: Arc<FakePorts>,
}

impl FakePlatform {
    /// Windows 10 host, driver service running, DHCP DNS servers
    pub fn new() -> Self {
        let journal = Journal::default();

        Self {
            services: Arc::new(FakeServices {
                status: Mutex::new(ServiceStatus::Running),
                fail_status: AtomicBool::new(false),
                fail_start: AtomicBool::new(false),
                journal: journal.clone(),
            }),
            drivers: Arc::new(FakeDrivers {
                fail_register: AtomicBool::new(false),
                journal: journal.clone(),
            }),
            host: Arc::new(FakeHost { os: Some((10, 0)) }),
            dns: Arc::new(FakeDns {
                servers: Mutex::new(vec!["192.168.1.1".to_string(), "fe80::1".to_string()]),
                fail_set: AtomicBool::new(false),
                journal: journal.clone(),
            }),
            firewall: Arc::new(FakeFirewall {
                journal: journal.clone(),
            }),
            network: Arc::new(FakeNetwork {
                online: AtomicBool::new(true),
                journal: journal.clone(),
            }),
            ports: Arc::new(FakePorts::default()),
            journal,
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            services: self.services.clone(),
            drivers: self.drivers.clone(),
            host: self.host.clone(),
            dns: self.dns.clone(),
            firewall: self.firewall.clone(),
            network: self.network.clone(),
            ports: self.ports.clone(),
        }
    }
}

/// Directory removed on drop
#[derive(Debug)]
pub(crate) struct TempDir(PathBuf);

impl TempDir {
    pub fn new(tag: &str) -> Self {
        static NEXT: AtomicUsize = AtomicUsize::new(0);

        let path = std::env::temp_dir().join(format!(
            "sluice-{}-{}-{}",
            tag,
            std::process::id(),
            NEXT.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&path).unwrap();
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn join(&self, name: &str) -> PathBuf {
        self.0.join(name)
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Write an executable shell script standing in for a backend
#[cfg(unix)]
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Shell snippet printing `line` and then idling
pub(crate) fn ready_after(line: &str) -> String {
    format!("echo '{line}'\nexec sleep 30")
}

/// Settings pointing at `dir`, with quick readiness polling
///
/// The bundled and installed driver images start out identical.
pub(crate) fn fast_settings(dir: &TempDir) -> Settings {
    let mut settings = Settings::default();
    settings.paths.bin_dir = dir.path().to_path_buf();
    settings.paths.work_dir = dir.join("data");
    settings.driver.installed_path = dir.join("installed.sys");
    settings.kill_stale_instances = false;
    settings.readiness.poll_interval_ms = 10;
    settings.readiness.max_polls = 30;

    std::fs::write(dir.join("Win-10.sys"), "2.0").unwrap();
    std::fs::write(dir.join("installed.sys"), "2.0").unwrap();
    settings
}
