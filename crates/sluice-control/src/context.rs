//! Shared session context

use crate::config::Settings;
use crate::event::EventBus;
use crate::platform::Platform;
use crate::port::PortPreflight;
use crate::readiness::PollPolicy;
use crate::resolver::ServerResolver;
use std::path::PathBuf;
use std::sync::Arc;

/// Everything a controller needs besides its own descriptors
#[derive(Debug, Clone)]
pub struct ControlContext {
    pub settings: Arc<Settings>,
    pub platform: Platform,
    pub resolver: Arc<ServerResolver>,
    pub events: EventBus,
}

impl ControlContext {
    pub fn new(settings: Settings, platform: Platform, events: EventBus) -> Self {
        let resolver = Arc::new(ServerResolver::new(settings.hosts.clone()));

        Self {
            settings: Arc::new(settings),
            platform,
            resolver,
            events,
        }
    }

    /// Full path of a bundled executable or driver image
    pub fn bin_path(&self, name: &str) -> PathBuf {
        self.settings.paths.bin_dir.join(name)
    }

    /// Full path of a generated file
    pub fn work_path(&self, name: &str) -> PathBuf {
        self.settings.paths.work_dir.join(name)
    }

    pub fn preflight(&self) -> PortPreflight {
        PortPreflight::new(self.platform.ports.clone(), self.settings.local_address)
    }

    pub fn poll_policy(&self) -> PollPolicy {
        self.settings.readiness.policy()
    }
}
