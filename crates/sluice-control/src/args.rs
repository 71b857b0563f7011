//! Redirector argument synthesis
//!
//! Pure functions turning a server, a mode and the global settings into the
//! redirector's launch argument string. Nothing here touches the network or
//! the file system; hostnames must already be resolved by the caller.

use crate::config::{Settings, UdpSelection};
use crate::model::{ModeDescriptor, RuleEntry, ServerDescriptor};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Helper process proxied implicitly outside whitelist mode
pub const IMPLICIT_HELPER: &str = "NTT.exe";

fn loopback(address: IpAddr) -> IpAddr {
    match address {
        address if address.is_loopback() => address,
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

/// Wrap `value` in double quotes for a Windows command line
///
/// Embedded quotes and the backslashes before them are escaped so the
/// value stays one argument.
pub fn quoted(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');

    let mut backslashes = 0;
    for c in value.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                out.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                out.push('"');
                backslashes = 0;
            }
            c => {
                out.extend(std::iter::repeat('\\').take(backslashes));
                out.push(c);
                backslashes = 0;
            }
        }
    }
    out.extend(std::iter::repeat('\\').take(backslashes * 2));

    out.push('"');
    out
}

/// A `host:port` relay target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16,
}

impl RelayTarget {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Loopback address of the local relay listening on `port`
    ///
    /// Relays may listen on a wildcard or LAN address; clients always reach
    /// them over loopback.
    pub fn local(settings: &Settings, port: u16) -> Self {
        Self::new(loopback(settings.local_address).to_string(), port)
    }

    /// Address a local relay listens on
    pub fn listen(settings: &Settings, port: u16) -> Self {
        Self::new(settings.local_address.to_string(), port)
    }

    /// TCP target for `server`
    ///
    /// Families with a local relay are reached through the SOCKS5 listener;
    /// a SOCKS5 server is addressed directly.
    pub fn primary(settings: &Settings, server: &ServerDescriptor) -> Self {
        if server.family.has_local_relay() {
            Self::local(settings, settings.socks5_local_port)
        } else {
            Self::new(server.hostname.clone(), server.port)
        }
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Where redirected UDP goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpRoute {
    /// Same target as TCP
    SameAsTcp,
    /// Loopback at the primary relay's port
    PrimaryRelay,
    /// A dedicated server entry
    Dedicated(ServerDescriptor),
}

/// Decide the UDP route for a session with `primary` as its server
pub fn plan_udp_route(settings: &Settings, primary: &ServerDescriptor) -> UdpRoute {
    let relay_through_primary = || {
        if primary.family.has_local_relay() {
            UdpRoute::PrimaryRelay
        } else {
            UdpRoute::SameAsTcp
        }
    };

    match settings.udp_server.selection() {
        UdpSelection::None => UdpRoute::SameAsTcp,
        UdpSelection::PrimaryRelay => relay_through_primary(),
        UdpSelection::Entry(_) => match settings.dedicated_udp_server() {
            Some(dedicated) if dedicated == primary => relay_through_primary(),
            Some(dedicated) => UdpRoute::Dedicated(dedicated.clone()),
            None => UdpRoute::SameAsTcp,
        },
    }
}

/// Address subset of the mode rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpFilter {
    /// `true`: everything except `list` is proxied
    pub bypass: bool,
    pub list: Vec<String>,
}

/// Fully decided redirector arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectorArgs {
    pub tcp: RelayTarget,
    pub udp: RelayTarget,
    pub credentials: Option<(String, String)>,
    pub whitelist: bool,
    pub processes: Vec<String>,
    pub ip_filter: Option<IpFilter>,
    pub print_proxy_ip: bool,
    pub udp_enable: bool,
}

impl RedirectorArgs {
    /// Build arguments for `server` (a resolved working copy) and `mode`
    pub fn build(
        settings: &Settings,
        server: &ServerDescriptor,
        mode: &ModeDescriptor,
        tcp: RelayTarget,
        udp: RelayTarget,
    ) -> Self {
        let mut processes = Vec::new();
        let mut addresses = Vec::new();

        if !settings.process_whitelist_mode {
            processes.push(IMPLICIT_HELPER.to_string());
        }

        for entry in mode.entries() {
            match entry {
                RuleEntry::Process(name) => processes.push(name.to_string()),
                RuleEntry::Address(literal) => addresses.push(literal.to_string()),
            }
        }

        if settings.process_whitelist_mode {
            processes.extend(
                settings
                    .managed_executables
                    .iter()
                    .filter_map(|exe| Path::new(exe).file_name())
                    .map(|name| name.to_string_lossy().into_owned()),
            );
        }

        let credentials = if server.family.has_local_relay() {
            None
        } else {
            server
                .credentials()
                .map(|(user, pass)| (user.to_string(), pass.to_string()))
        };

        let ip_filter = (!addresses.is_empty()).then(|| IpFilter {
            bypass: mode.ip_filter_bypass,
            list: addresses,
        });

        Self {
            tcp,
            udp,
            credentials,
            whitelist: settings.process_whitelist_mode,
            processes,
            ip_filter,
            print_proxy_ip: settings.process_proxy_ip_log,
            udp_enable: !settings.process_no_proxy_for_udp,
        }
    }
}

impl fmt::Display for RedirectorArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-rtcp {}", self.tcp)?;
        if let Some((user, pass)) = &self.credentials {
            write!(f, " -username {} -password {}", quoted(user), quoted(pass))?;
        }
        write!(f, " -rudp {}", self.udp)?;
        write!(f, " -bypass {}", self.whitelist)?;
        write!(f, " -p \"{}\"", self.processes.join(","))?;

        match &self.ip_filter {
            Some(filter) => write!(
                f,
                " -bypassip {} -fip \"{}\"",
                filter.bypass,
                filter.list.join(",")
            )?,
            None => write!(f, " -bypassip true")?,
        }

        write!(f, " -printProxyIP {}", self.print_proxy_ip)?;
        write!(f, " -udpEnable {}", self.udp_enable)?;
        write!(f, " -dlog")
    }
}
