//! Settings
//!
//! Global settings shared by every controller of a session. Loaded from a
//! TOML file; missing keys fall back to the defaults below.

use crate::model::{ModeDescriptor, ServerDescriptor};
use crate::readiness::PollPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Dedicated UDP server index meaning "relay UDP through the primary server"
pub const USE_PRIMARY_RELAY: i32 = -1;

/// Dedicated UDP server selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpServerSetting {
    /// Use a dedicated UDP server at all
    pub enabled: bool,
    /// Index into `Settings::servers`, or [`USE_PRIMARY_RELAY`]
    pub index: i32,
}

impl Default for UdpServerSetting {
    fn default() -> Self {
        Self {
            enabled: false,
            index: USE_PRIMARY_RELAY,
        }
    }
}

/// Resolved UDP server selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpSelection {
    /// No dedicated server
    None,
    /// Sentinel: relay through the primary
    PrimaryRelay,
    /// A specific server entry
    Entry(usize),
}

impl UdpServerSetting {
    /// Interpret the raw setting
    pub fn selection(&self) -> UdpSelection {
        if !self.enabled {
            UdpSelection::None
        } else if self.index < 0 {
            UdpSelection::PrimaryRelay
        } else {
            UdpSelection::Entry(self.index as usize)
        }
    }
}

/// Where executables and generated files live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    /// Directory holding backend executables and bundled drivers
    pub bin_dir: PathBuf,
    /// Directory for generated backend configuration files
    pub work_dir: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            bin_dir: PathBuf::from("bin"),
            work_dir: PathBuf::from("data"),
        }
    }
}

/// Readiness polling bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessSettings {
    /// Poll interval (milliseconds)
    pub poll_interval_ms: u64,
    /// Maximum number of polls before a timeout is declared
    pub max_polls: u32,
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            max_polls: 200,
        }
    }
}

impl ReadinessSettings {
    /// Poll policy for readiness watchers
    pub fn policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.poll_interval_ms), self.max_polls)
    }
}

/// Redirection driver settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverSettings {
    /// Name of the system service hosting the driver
    pub service_name: String,
    /// Installed driver location
    pub installed_path: PathBuf,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            service_name: "netfilter2".to_string(),
            installed_path: PathBuf::from(r"C:\Windows\System32\drivers\netfilter2.sys"),
        }
    }
}

/// Complete settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Address local relays listen on
    pub local_address: IpAddr,
    /// Local SOCKS5 relay port
    pub socks5_local_port: u16,
    /// Local HTTP relay port (rule mode)
    pub http_local_port: u16,
    /// Resolve the server hostname before starting anything
    pub resolve_server_hostname: bool,
    /// Process list means "bypass these" instead of "proxy these"
    pub process_whitelist_mode: bool,
    /// Ask the redirector to log proxied addresses
    pub process_proxy_ip_log: bool,
    /// Leave UDP of redirected processes alone
    pub process_no_proxy_for_udp: bool,
    /// Override system DNS while the redirector runs
    pub modify_system_dns: bool,
    /// DNS servers applied by the override
    pub override_dns: Vec<String>,
    /// Kill leftover backend processes before starting a primary relay
    pub kill_stale_instances: bool,
    /// Endpoint used to check that a route to the internet exists
    pub connectivity_probe: SocketAddr,
    /// Executables of this system, given firewall allowances and exempted in
    /// whitelist mode
    pub managed_executables: Vec<String>,
    /// STUN server used by the NAT type helper
    pub stun_server: String,
    /// Dedicated UDP server
    pub udp_server: UdpServerSetting,
    /// Configured servers
    pub servers: Vec<ServerDescriptor>,
    /// Configured modes
    pub modes: Vec<ModeDescriptor>,
    /// Static host table consulted before DNS
    pub hosts: HashMap<String, IpAddr>,
    /// Executable and data directories
    pub paths: PathSettings,
    /// Readiness polling bounds
    pub readiness: ReadinessSettings,
    /// Redirection driver
    pub driver: DriverSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            local_address: IpAddr::from([127, 0, 0, 1]),
            socks5_local_port: 2801,
            http_local_port: 2802,
            resolve_server_hostname: false,
            process_whitelist_mode: false,
            process_proxy_ip_log: false,
            process_no_proxy_for_udp: false,
            modify_system_dns: false,
            override_dns: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            kill_stale_instances: true,
            connectivity_probe: SocketAddr::from(([114, 114, 114, 114], 53)),
            managed_executables: default_managed_executables(),
            stun_server: "stun.stunprotocol.org".to_string(),
            udp_server: UdpServerSetting::default(),
            servers: Vec::new(),
            modes: Vec::new(),
            hosts: HashMap::new(),
            paths: PathSettings::default(),
            readiness: ReadinessSettings::default(),
            driver: DriverSettings::default(),
        }
    }
}

fn default_managed_executables() -> Vec<String> {
    [
        "sluice.exe",
        "NTT.exe",
        "Redirector.exe",
        "Privoxy.exe",
        "Shadowsocks.exe",
        "ShadowsocksR.exe",
        "Trojan.exe",
        "v2ray.exe",
    ]
    .iter()
    .map(|name| name.to_string())
    .collect()
}

impl Settings {
    /// Load from a TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Export as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socks5_local_port == 0 || self.http_local_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.socks5_local_port == self.http_local_port {
            return Err(ConfigError::PortClash(self.socks5_local_port));
        }
        if self.readiness.max_polls == 0 {
            return Err(ConfigError::InvalidReadiness);
        }
        if let UdpSelection::Entry(index) = self.udp_server.selection() {
            if index >= self.servers.len() {
                return Err(ConfigError::UnknownUdpServer(index));
            }
        }
        Ok(())
    }

    /// Dedicated UDP server, when a specific entry is selected
    pub fn dedicated_udp_server(&self) -> Option<&ServerDescriptor> {
        match self.udp_server.selection() {
            UdpSelection::Entry(index) => self.servers.get(index),
            _ => None,
        }
    }

    /// Full paths of the managed executables
    pub fn managed_paths(&self) -> Vec<PathBuf> {
        self.managed_executables
            .iter()
            .map(|name| self.paths.bin_dir.join(name))
            .collect()
    }

    /// Local relay endpoint for a port
    pub fn local_endpoint(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.local_address, port)
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid local port")]
    InvalidPort,

    #[error("SOCKS5 and HTTP relays cannot share port {0}")]
    PortClash(u16),

    #[error("Readiness polling needs at least one poll")]
    InvalidReadiness,

    #[error("Dedicated UDP server {0} does not exist")]
    UnknownUdpServer(usize),

    #[error("Failed to read settings: {0}")]
    Io(String),

    #[error("Failed to parse settings: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModeKind, ProtocolFamily};

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();

        assert_eq!(settings.socks5_local_port, 2801);
        assert_eq!(settings.override_dns, vec!["1.1.1.1", "8.8.8.8"]);
        assert_eq!(settings.udp_server.selection(), UdpSelection::None);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_udp_selection() {
        let mut setting = UdpServerSetting {
            enabled: true,
            index: USE_PRIMARY_RELAY,
        };
        assert_eq!(setting.selection(), UdpSelection::PrimaryRelay);

        setting.index = 2;
        assert_eq!(setting.selection(), UdpSelection::Entry(2));

        setting.enabled = false;
        assert_eq!(setting.selection(), UdpSelection::None);
    }

    #[test]
    fn test_from_toml() {
        let settings = Settings::from_toml(
            r#"
            socks5_local_port = 3000
            modify_system_dns = true

            [udp_server]
            enabled = true
            index = 0

            [[servers]]
            remark = "tokyo"
            family = "Shadowsocks"
            hostname = "jp.example.com"
            port = 8388
            password = "secret"
            params = { method = "aes-256-gcm" }

            [[modes]]
            kind = "Redirector"
            rules = ["chrome.exe", "10.0.0.0/8"]
            "#,
        )
        .unwrap();

        assert_eq!(settings.socks5_local_port, 3000);
        assert_eq!(settings.http_local_port, 2802);
        assert!(settings.modify_system_dns);
        assert_eq!(settings.servers[0].family, ProtocolFamily::Shadowsocks);
        assert_eq!(settings.servers[0].params.method.as_deref(), Some("aes-256-gcm"));
        assert_eq!(settings.modes[0].kind, ModeKind::Redirector);
        assert_eq!(settings.dedicated_udp_server().unwrap().remark, "tokyo");
    }

    #[test]
    fn test_validate_rejects_unknown_udp_server() {
        let mut settings = Settings::default();
        settings.udp_server = UdpServerSetting {
            enabled: true,
            index: 3,
        };

        assert!(matches!(
            settings.validate(),
            Err(ConfigError::UnknownUdpServer(3))
        ));
    }

    #[test]
    fn test_validate_rejects_port_clash() {
        let mut settings = Settings::default();
        settings.http_local_port = settings.socks5_local_port;

        assert!(matches!(settings.validate(), Err(ConfigError::PortClash(2801))));
    }

    #[test]
    fn test_toml_roundtrip() {
        let settings = Settings::default();
        let text = settings.to_toml().unwrap();
        let parsed = Settings::from_toml(&text).unwrap();

        assert_eq!(parsed, settings);
    }
}
