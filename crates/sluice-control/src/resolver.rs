//! Server hostname resolution
//!
//! Resolves server hostnames before their addresses are handed to backends:
//! - Address literals pass through untouched
//! - The static host table wins over DNS
//! - Successful lookups are cached until `clear_cache`

use crate::error::ControlError;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Cache lifetime of a successful lookup
const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy)]
struct CacheEntry {
    address: IpAddr,
    expires_at: Instant,
}

/// Hostname resolver with static hosts and a cache
pub struct ServerResolver {
    resolver: TokioAsyncResolver,
    hosts: HashMap<String, IpAddr>,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl ServerResolver {
    /// Create a resolver using the system configuration
    ///
    /// Falls back to Cloudflare when the system configuration is unreadable.
    pub fn new(hosts: HashMap<String, IpAddr>) -> Self {
        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
            warn!("System DNS configuration unavailable ({}), using Cloudflare", e);
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), ResolverOpts::default())
        });

        let hosts = hosts
            .into_iter()
            .map(|(name, address)| (name.to_lowercase(), address))
            .collect();

        Self {
            resolver,
            hosts,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `host` to a single address, preferring IPv4
    pub async fn resolve(&self, host: &str) -> Result<IpAddr, ControlError> {
        if let Ok(address) = host.parse::<IpAddr>() {
            return Ok(address);
        }

        let normalized = host.trim().trim_end_matches('.').to_lowercase();
        if let Some(address) = self.hosts.get(&normalized) {
            debug!("Static host entry for {}: {}", host, address);
            return Ok(*address);
        }

        if let Some(address) = self.cached(&normalized) {
            debug!("DNS cache hit for {}", host);
            return Ok(address);
        }

        let lookup = self.resolver.lookup_ip(normalized.as_str()).await.map_err(|e| {
            warn!("Lookup of {} failed: {}", host, e);
            ControlError::Resolution {
                host: host.to_string(),
            }
        })?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        let address = addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
            .ok_or_else(|| ControlError::Resolution {
                host: host.to_string(),
            })?;

        self.lock().insert(
            normalized,
            CacheEntry {
                address,
                expires_at: Instant::now() + CACHE_TTL,
            },
        );

        info!("Resolved {} to {}", host, address);
        Ok(address)
    }

    /// Drop all cached lookups
    pub fn clear_cache(&self) {
        self.lock().clear();
        debug!("Resolver cache cleared");
    }

    fn cached(&self, host: &str) -> Option<IpAddr> {
        self.lock()
            .get(host)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.address)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ServerResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerResolver")
            .field("hosts", &self.hosts.len())
            .finish_non_exhaustive()
    }
}
