//! Server and mode descriptors
//!
//! A [`ServerDescriptor`] names one remote relay; a [`ModeDescriptor`] names
//! how local traffic gets redirected to it. Both are immutable for the
//! duration of a session.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolFamily {
    /// Plain SOCKS5 server, reached directly with no local relay process
    Socks5,
    Shadowsocks,
    ShadowsocksR,
    VMess,
    Trojan,
}

impl ProtocolFamily {
    /// All supported families
    pub fn all() -> &'static [ProtocolFamily] {
        &[
            ProtocolFamily::Socks5,
            ProtocolFamily::Shadowsocks,
            ProtocolFamily::ShadowsocksR,
            ProtocolFamily::VMess,
            ProtocolFamily::Trojan,
        ]
    }

    /// Short display tag
    pub fn tag(&self) -> &'static str {
        match self {
            ProtocolFamily::Socks5 => "Socks5",
            ProtocolFamily::Shadowsocks => "SS",
            ProtocolFamily::ShadowsocksR => "SSR",
            ProtocolFamily::VMess => "VMess",
            ProtocolFamily::Trojan => "Trojan",
        }
    }

    /// Whether servers of this family need a local relay process
    ///
    /// SOCKS5 servers are already what the redirector speaks, so they are
    /// passed through untouched.
    pub fn has_local_relay(&self) -> bool {
        !matches!(self, ProtocolFamily::Socks5)
    }
}

impl fmt::Display for ProtocolFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Protocol specific parameters
///
/// Only the fields relevant to a family are read by its backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerParams {
    /// Encryption method (SS, SSR, VMess security)
    pub method: Option<String>,
    /// SIP003 plugin executable (SS)
    pub plugin: Option<String>,
    /// SIP003 plugin options (SS)
    pub plugin_options: Option<String>,
    /// SSR protocol
    pub protocol: Option<String>,
    /// SSR protocol parameter
    pub protocol_param: Option<String>,
    /// SSR obfuscation
    pub obfs: Option<String>,
    /// SSR obfuscation parameter
    pub obfs_param: Option<String>,
    /// VMess user id
    pub user_id: Option<String>,
    /// VMess alter id
    pub alter_id: Option<u16>,
    /// VMess stream transport (tcp, ws, ...)
    pub transport: Option<String>,
    /// Wrap the stream in TLS (VMess)
    pub tls: bool,
    /// TLS server name (VMess, Trojan)
    pub sni: Option<String>,
}

/// One configured remote server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// User facing name
    #[serde(default)]
    pub remark: String,
    /// Protocol family
    pub family: ProtocolFamily,
    /// Hostname or address
    pub hostname: String,
    /// Remote port
    pub port: u16,
    /// Username (SOCKS5)
    #[serde(default)]
    pub username: Option<String>,
    /// Password (SOCKS5, SS, SSR, Trojan)
    #[serde(default)]
    pub password: Option<String>,
    /// Protocol specific parameters
    #[serde(default)]
    pub params: ServerParams,
}

impl ServerDescriptor {
    /// Create a descriptor with no credentials or parameters
    pub fn new(family: ProtocolFamily, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            remark: String::new(),
            family,
            hostname: hostname.into(),
            port,
            username: None,
            password: None,
            params: ServerParams::default(),
        }
    }

    /// Working copy with the hostname rewritten to a resolved address
    ///
    /// The original name is kept as the TLS server name unless one is set.
    pub fn with_hostname(&self, hostname: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let mut params = self.params.clone();
        if params.sni.is_none()
            && hostname != self.hostname
            && self.hostname.parse::<std::net::IpAddr>().is_err()
        {
            params.sni = Some(self.hostname.clone());
        }

        Self {
            hostname,
            params,
            ..self.clone()
        }
    }

    /// Username and password, only when both are non-empty
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let username = self.username.as_deref().map(str::trim).unwrap_or_default();
        let password = self.password.as_deref().map(str::trim).unwrap_or_default();

        if username.is_empty() || password.is_empty() {
            None
        } else {
            Some((username, password))
        }
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.remark.is_empty() {
            write!(f, "[{}] {}:{}", self.family, self.hostname, self.port)
        } else {
            write!(f, "[{}] {}", self.family, self.remark)
        }
    }
}

/// Traffic redirection strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModeKind {
    /// Kernel driver redirects selected processes to the local proxy
    Redirector,
    /// HTTP front relay with direct-connect rules
    Rule,
    /// Only the local relay listener is exposed
    PassThrough,
}

impl ModeKind {
    /// Whether the mode is nothing but the server's local relay listener
    pub fn exposes_local_relay_only(&self) -> bool {
        matches!(self, ModeKind::PassThrough)
    }
}

impl fmt::Display for ModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModeKind::Redirector => "Redirector",
            ModeKind::Rule => "Rule",
            ModeKind::PassThrough => "PassThrough",
        };
        f.write_str(name)
    }
}

/// A traffic redirection mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModeDescriptor {
    /// User facing name
    #[serde(default)]
    pub remark: String,
    /// Strategy
    pub kind: ModeKind,
    /// Mixed rule list: executable names and address literals/CIDRs
    #[serde(default)]
    pub rules: Vec<String>,
    /// For the address subset: `true` proxies everything except the listed
    /// addresses, `false` proxies only the listed addresses
    #[serde(default)]
    pub ip_filter_bypass: bool,
}

impl ModeDescriptor {
    /// Create a mode with no rules
    pub fn new(kind: ModeKind) -> Self {
        Self {
            remark: String::new(),
            kind,
            rules: Vec::new(),
            ip_filter_bypass: false,
        }
    }

    /// Builder-style rule list
    pub fn with_rules<I, S>(mut self, rules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rules = rules.into_iter().map(Into::into).collect();
        self
    }

    /// Classified, non-empty rule entries
    pub fn entries(&self) -> impl Iterator<Item = RuleEntry<'_>> {
        self.rules
            .iter()
            .map(|rule| rule.trim())
            .filter(|rule| !rule.is_empty() && !rule.starts_with('#'))
            .map(RuleEntry::classify)
    }
}

impl fmt::Display for ModeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]{}", self.kind, self.remark)
    }
}

/// Executable suffix marking process-scoped rule entries
pub const EXECUTABLE_SUFFIX: &str = ".exe";

/// One rule entry, disambiguated by suffix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleEntry<'a> {
    /// Process name, redirected by process
    Process(&'a str),
    /// Address literal or CIDR, used by the IP filter
    Address(&'a str),
}

impl<'a> RuleEntry<'a> {
    /// Classify a raw rule entry
    pub fn classify(entry: &'a str) -> Self {
        let is_process = entry.len() >= EXECUTABLE_SUFFIX.len()
            && entry.is_char_boundary(entry.len() - EXECUTABLE_SUFFIX.len())
            && entry[entry.len() - EXECUTABLE_SUFFIX.len()..].eq_ignore_ascii_case(EXECUTABLE_SUFFIX);

        if is_process {
            RuleEntry::Process(entry)
        } else {
            RuleEntry::Address(entry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_classification() {
        assert_eq!(RuleEntry::classify("chrome.exe"), RuleEntry::Process("chrome.exe"));
        assert_eq!(RuleEntry::classify("Game.EXE"), RuleEntry::Process("Game.EXE"));
        assert_eq!(RuleEntry::classify("10.0.0.0/8"), RuleEntry::Address("10.0.0.0/8"));
        assert_eq!(RuleEntry::classify("exe"), RuleEntry::Address("exe"));
    }

    #[test]
    fn test_entries_skip_comments_and_blanks() {
        let mode = ModeDescriptor::new(ModeKind::Redirector)
            .with_rules(["# games", "", "  steam.exe ", "1.1.1.1"]);
        let entries: Vec<_> = mode.entries().collect();

        assert_eq!(
            entries,
            vec![RuleEntry::Process("steam.exe"), RuleEntry::Address("1.1.1.1")]
        );
    }

    #[test]
    fn test_credentials_require_both() {
        let mut server = ServerDescriptor::new(ProtocolFamily::Socks5, "example.com", 1080);
        assert!(server.credentials().is_none());

        server.username = Some("user".into());
        assert!(server.credentials().is_none());

        server.password = Some("  ".into());
        assert!(server.credentials().is_none());

        server.password = Some("secret".into());
        assert_eq!(server.credentials(), Some(("user", "secret")));
    }

    #[test]
    fn test_working_copy() {
        let server = ServerDescriptor::new(ProtocolFamily::Trojan, "example.com", 443);
        let resolved = server.with_hostname("93.184.216.34");

        assert_eq!(resolved.hostname, "93.184.216.34");
        assert_eq!(server.hostname, "example.com");
        assert_eq!(resolved.port, 443);
        assert_eq!(resolved.params.sni.as_deref(), Some("example.com"));
        assert!(resolved.with_hostname("1.1.1.1").params.sni.as_deref() == Some("example.com"));
    }

    #[test]
    fn test_local_relay() {
        assert!(!ProtocolFamily::Socks5.has_local_relay());
        assert!(ProtocolFamily::all()[1..].iter().all(|f| f.has_local_relay()));
    }
}
