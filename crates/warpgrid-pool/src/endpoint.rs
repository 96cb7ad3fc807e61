//! Endpoint cache: resolved addresses for one destination.
//!
//! The cache holds an immutable [`EndpointSnapshot`] behind an [`ArcSwap`].
//! A refresh builds a new snapshot and swaps the pointer; borrowers holding
//! the previous `Arc` keep reading it undisturbed.
//!
//! # Refresh coordination
//!
//! ```text
//! get()
//!   → snapshot fresh under the DnsRefresh policy → return it (same Arc)
//!   → stale → take the refresh lock
//!     → pointer changed while waiting → another task refreshed, reuse it
//!     → otherwise resolve, install the new snapshot, return it
//! ```
//!
//! At most one resolution per cache is in flight; tasks that observed the
//! same stale snapshot converge on its result.

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::DnsRefresh;
use crate::error::{PoolError, PoolResult};

// ── Destination ──────────────────────────────────────────────────────

/// A parsed destination: `host:port`, `[v6]:port`, or an `http(s)://` URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Destination {
    pub host: String,
    pub port: u16,
}

impl Destination {
    /// Parse a destination string.
    ///
    /// URL schemes supply a default port (`http` → 80, `https` → 443).
    /// Any path or query after the authority is ignored.
    pub fn parse(destination: &str) -> PoolResult<Self> {
        let invalid = || PoolError::InvalidDestination(destination.to_string());

        let trimmed = destination.trim();
        let (rest, default_port) = if let Some(rest) = trimmed.strip_prefix("http://") {
            (rest, Some(80))
        } else if let Some(rest) = trimmed.strip_prefix("https://") {
            (rest, Some(443))
        } else {
            (trimmed, None)
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid());
        }

        // Bracketed IPv6: [::1]:8080
        if let Some(inner) = authority.strip_prefix('[') {
            let (host, after) = inner.split_once(']').ok_or_else(invalid)?;
            let port = match after.strip_prefix(':') {
                Some(port) => port.parse().map_err(|_| invalid())?,
                None if after.is_empty() => default_port.ok_or_else(invalid)?,
                None => return Err(invalid()),
            };
            return Ok(Self {
                host: host.to_string(),
                port,
            });
        }

        // Bare IPv6 literal without a port.
        if authority.parse::<IpAddr>().is_ok_and(|ip| ip.is_ipv6()) {
            return Ok(Self {
                host: authority.to_string(),
                port: default_port.ok_or_else(invalid)?,
            });
        }

        match authority.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => Ok(Self {
                host: host.to_string(),
                port: port.parse().map_err(|_| invalid())?,
            }),
            Some(_) => Err(invalid()),
            None => Ok(Self {
                host: authority.to_string(),
                port: default_port.ok_or_else(invalid)?,
            }),
        }
    }

    /// `host:port` form suitable for `tokio::net::lookup_host`.
    pub fn lookup_target(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

// ── Resolvers ────────────────────────────────────────────────────────

/// Resolves a destination into an ordered list of socket addresses.
///
/// An empty result means resolution failed.
pub trait Resolve: Send + Sync + 'static {
    fn resolve(&self, destination: &str) -> impl Future<Output = Vec<SocketAddr>> + Send;
}

/// Resolves through the host system DNS via `tokio::net::lookup_host`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    async fn resolve(&self, destination: &str) -> Vec<SocketAddr> {
        let target = match Destination::parse(destination) {
            Ok(dest) => dest.lookup_target(),
            Err(e) => {
                tracing::warn!(destination = %destination, error = %e, "cannot resolve destination");
                return Vec::new();
            }
        };

        match tokio::net::lookup_host(&target).await {
            Ok(addrs) => {
                let addrs: Vec<SocketAddr> = addrs.collect();
                tracing::debug!(
                    destination = %destination,
                    source = "system_dns",
                    count = addrs.len(),
                    "resolved destination"
                );
                addrs
            }
            Err(e) => {
                tracing::warn!(destination = %destination, error = %e, "system DNS lookup failed");
                Vec::new()
            }
        }
    }
}

/// Resolves from a fixed, case-insensitive table of destinations.
///
/// Useful for pinned deployments and for tests. Unknown destinations
/// resolve to nothing.
#[derive(Clone, Debug, Default)]
pub struct StaticResolver {
    entries: Arc<HashMap<String, Vec<SocketAddr>>>,
}

impl StaticResolver {
    pub fn new(entries: HashMap<String, Vec<SocketAddr>>) -> Self {
        let entries = entries
            .into_iter()
            .map(|(name, addrs)| (name.to_lowercase(), addrs))
            .collect();
        Self {
            entries: Arc::new(entries),
        }
    }

    /// Table with a single destination.
    pub fn single(destination: &str, addrs: Vec<SocketAddr>) -> Self {
        Self::new(HashMap::from([(destination.to_string(), addrs)]))
    }
}

impl Resolve for StaticResolver {
    async fn resolve(&self, destination: &str) -> Vec<SocketAddr> {
        self.entries
            .get(&destination.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

// ── Snapshot ─────────────────────────────────────────────────────────

/// Immutable point-in-time resolution result.
///
/// Compare identities with `Arc::ptr_eq` to tell "same snapshot" from
/// "replaced snapshot".
#[derive(Debug, Default)]
pub struct EndpointSnapshot {
    endpoints: Vec<SocketAddr>,
    resolved_at: Option<Instant>,
}

impl EndpointSnapshot {
    /// When this snapshot was resolved; `None` for the initial empty snapshot.
    pub fn resolved_at(&self) -> Option<Instant> {
        self.resolved_at
    }
}

impl Deref for EndpointSnapshot {
    type Target = [SocketAddr];

    fn deref(&self) -> &[SocketAddr] {
        &self.endpoints
    }
}

// ── Cache ────────────────────────────────────────────────────────────

/// Per-destination endpoint cache with single-flight refresh.
pub struct EndpointCache<R> {
    host: String,
    resolver: R,
    policy: DnsRefresh,
    current: ArcSwap<EndpointSnapshot>,
    /// Serializes resolutions; never held while touching `current` readers.
    refresh: Mutex<()>,
    /// Bumped once per finished resolution; waiters compare it to tell
    /// whether someone resolved while they queued.
    resolutions: AtomicU64,
}

impl<R: Resolve> EndpointCache<R> {
    pub fn new(host: &str, resolver: R, policy: DnsRefresh) -> Self {
        Self {
            host: host.to_string(),
            resolver,
            policy,
            current: ArcSwap::from_pointee(EndpointSnapshot::default()),
            refresh: Mutex::new(()),
            resolutions: AtomicU64::new(0),
        }
    }

    /// The current snapshot, without triggering a refresh.
    pub fn snapshot(&self) -> Arc<EndpointSnapshot> {
        self.current.load_full()
    }

    /// Number of resolutions performed so far, failed ones included.
    pub fn resolutions(&self) -> u64 {
        self.resolutions.load(Ordering::Relaxed)
    }

    /// The snapshot to connect with, refreshing first when the policy says so.
    ///
    /// An empty resolution never replaces the installed snapshot; the stale
    /// one (possibly empty) is returned and the next access retries.
    ///
    /// Callers that find the snapshot stale while a resolution is already
    /// running wait for it and share its outcome, successful or not.
    pub async fn get(&self) -> Arc<EndpointSnapshot> {
        let attempts = self.resolutions.load(Ordering::Acquire);
        let seen = self.current.load_full();
        if self.policy.is_fresh(seen.resolved_at, Instant::now()) {
            return seen;
        }

        let _refreshing = self.refresh.lock().await;

        let latest = self.current.load_full();
        if !Arc::ptr_eq(&latest, &seen) || self.resolutions.load(Ordering::Acquire) != attempts {
            return latest;
        }

        let endpoints = self.resolver.resolve(&self.host).await;
        let resolutions = self.resolutions.fetch_add(1, Ordering::AcqRel) + 1;

        if endpoints.is_empty() {
            tracing::warn!(
                host = %self.host,
                resolutions,
                "resolution returned no endpoints, keeping previous snapshot"
            );
            return latest;
        }

        let fresh = Arc::new(EndpointSnapshot {
            endpoints,
            resolved_at: Some(Instant::now()),
        });
        self.current.store(Arc::clone(&fresh));
        tracing::debug!(
            host = %self.host,
            count = fresh.len(),
            resolutions,
            "installed new endpoint snapshot"
        );
        fresh
    }
}

impl<R> std::fmt::Debug for EndpointCache<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointCache")
            .field("host", &self.host)
            .field("policy", &self.policy)
            .field("endpoints", &self.current.load().len())
            .finish_non_exhaustive()
    }
}
