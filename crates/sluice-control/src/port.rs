//! Local port preflight
//!
//! Fixed local ports are checked before anything is spawned so the user gets
//! a precise message instead of a backend that dies on bind.

use crate::platform::{offload, ReservedPorts};
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, UdpSocket};
use std::sync::Arc;
use tracing::{debug, warn};

/// Transport protocol of a port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// Which transports a listener needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Tcp,
    Udp,
    Both,
}

impl PortType {
    fn transports(&self) -> &'static [Transport] {
        match self {
            PortType::Tcp => &[Transport::Tcp],
            PortType::Udp => &[Transport::Udp],
            PortType::Both => &[Transport::Tcp, Transport::Udp],
        }
    }
}

/// Why a port cannot be used
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortConflict {
    #[error("The {name} ({port}) port is in use")]
    InUse { name: String, port: u16 },

    #[error("The {name} ({port}) port is reserved by system")]
    Reserved { name: String, port: u16 },
}

impl PortConflict {
    pub fn port(&self) -> u16 {
        match self {
            PortConflict::InUse { port, .. } | PortConflict::Reserved { port, .. } => *port,
        }
    }
}

/// Port checker bound to the local listen address
#[derive(Clone)]
pub struct PortPreflight {
    reserved: Arc<dyn ReservedPorts>,
    address: IpAddr,
}

impl PortPreflight {
    pub fn new(reserved: Arc<dyn ReservedPorts>, address: IpAddr) -> Self {
        Self { reserved, address }
    }

    /// Check that `port` is free for every transport `kind` needs
    ///
    /// Reserved ranges are consulted first; a failure to read them is logged
    /// and the bind test alone decides.
    pub async fn check(&self, port: u16, name: &str, kind: PortType) -> Result<(), PortConflict> {
        for &transport in kind.transports() {
            let reserved = self.reserved.clone();
            let ranges = match offload(move || reserved.reserved_ranges(transport)).await {
                Ok(ranges) => ranges,
                Err(e) => {
                    warn!("Failed to read reserved {:?} port ranges: {}", transport, e);
                    Vec::new()
                }
            };

            if ranges.iter().any(|range| range.contains(&port)) {
                return Err(PortConflict::Reserved {
                    name: name.to_string(),
                    port,
                });
            }

            let addr = SocketAddr::new(self.address, port);
            if let Err(e) = try_bind(addr, transport) {
                return match e.kind() {
                    io::ErrorKind::AddrInUse => Err(PortConflict::InUse {
                        name: name.to_string(),
                        port,
                    }),
                    io::ErrorKind::PermissionDenied => Err(PortConflict::Reserved {
                        name: name.to_string(),
                        port,
                    }),
                    _ => {
                        warn!("Bind test of {} {:?} failed: {}", addr, transport, e);
                        Ok(())
                    }
                };
            }
        }

        debug!("Port {} ({}) is free", port, name);
        Ok(())
    }
}

fn try_bind(addr: SocketAddr, transport: Transport) -> io::Result<()> {
    match transport {
        Transport::Tcp => TcpListener::bind(addr).map(drop),
        Transport::Udp => UdpSocket::bind(addr).map(drop),
    }
}
