//! Pool configuration: typed settings plus the `pool.toml` file surface.
//!
//! [`PoolConfig`] is what the pool consumes. [`PoolConfigFile`] is the
//! user-facing TOML representation where every field is optional and
//! durations are written as strings (`"500ms"`, `"5s"`, `"1m"`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{PoolError, PoolResult};

/// How long a resolved endpoint snapshot stays fresh.
///
/// The signed form used by the file format maps as follows: a positive
/// duration is [`DnsRefresh::Every`], zero is [`DnsRefresh::Always`] and a
/// negative duration is [`DnsRefresh::Once`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DnsRefresh {
    /// Resolve on every access; nothing is cached.
    Always,
    /// Reuse the snapshot until it is older than the given duration.
    Every(Duration),
    /// Resolve once on first use and never again.
    Once,
}

impl Default for DnsRefresh {
    fn default() -> Self {
        DnsRefresh::Every(Duration::from_secs(300))
    }
}

impl DnsRefresh {
    /// Build a policy from a signed millisecond count.
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            0 => DnsRefresh::Always,
            m if m < 0 => DnsRefresh::Once,
            m => DnsRefresh::Every(Duration::from_millis(m.unsigned_abs())),
        }
    }

    /// Whether a snapshot resolved at `resolved_at` may still be served at `now`.
    pub(crate) fn is_fresh(&self, resolved_at: Option<Instant>, now: Instant) -> bool {
        let Some(resolved_at) = resolved_at else {
            return false;
        };
        match self {
            DnsRefresh::Always => false,
            DnsRefresh::Once => true,
            DnsRefresh::Every(window) => now.saturating_duration_since(resolved_at) < *window,
        }
    }
}

/// Configuration for a single-destination [`ClientPool`](crate::pool::ClientPool).
#[derive(Clone, Debug, PartialEq)]
pub struct PoolConfig {
    /// Cap on connections alive at once, borrowed or free (default: 100).
    pub max_connection: usize,
    /// Extra connect attempts after the first one fails (default: 3).
    pub connect_retry_count: u32,
    /// Period between the starts of two consecutive connect attempts (default: 1s).
    pub reconnect_wait_time: Duration,
    /// Free connections idle longer than this are evicted (default: 30s).
    pub idle_timeout: Duration,
    /// Idle threshold for never-reused connections returned beyond current demand (default: 1s).
    pub short_connect_idle_timeout: Duration,
    /// Maximum connections evicted per sweep tick (default: 1000).
    pub idle_queue_per_max_clear_count: usize,
    /// Endpoint cache freshness policy (default: refresh every 5 minutes).
    pub dns_cache_update_duration: DnsRefresh,
    /// Absolute age cap for a connection; `None` means unlimited (default).
    pub max_connection_life_time: Option<Duration>,
    /// Maximum time to wait for a slot at capacity; `None` waits forever (default).
    pub max_wait: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connection: 100,
            connect_retry_count: 3,
            reconnect_wait_time: Duration::from_secs(1),
            idle_timeout: Duration::from_secs(30),
            short_connect_idle_timeout: Duration::from_secs(1),
            idle_queue_per_max_clear_count: 1000,
            dns_cache_update_duration: DnsRefresh::default(),
            max_connection_life_time: None,
            max_wait: None,
        }
    }
}

impl PoolConfig {
    /// Reject configurations the pool cannot run with.
    pub fn validate(&self) -> PoolResult<()> {
        if self.max_connection == 0 {
            return Err(PoolError::Config("max_connection must be at least 1".to_string()));
        }
        if self.idle_queue_per_max_clear_count == 0 {
            return Err(PoolError::Config(
                "idle_queue_per_max_clear_count must be at least 1".to_string(),
            ));
        }
        if self.idle_timeout.is_zero() || self.short_connect_idle_timeout.is_zero() {
            return Err(PoolError::Config("idle timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    /// Interval between eviction sweeps.
    ///
    /// Half of the shortest expiry threshold, so a connection never outlives
    /// its threshold by more than one tick.
    pub fn sweep_interval(&self) -> Duration {
        let mut shortest = self.idle_timeout.min(self.short_connect_idle_timeout);
        if let Some(life) = self.max_connection_life_time {
            shortest = shortest.min(life);
        }
        (shortest / 2).max(Duration::from_millis(1))
    }

    /// Parse a `pool.toml` document.
    pub fn from_toml_str(content: &str) -> PoolResult<Self> {
        let file: PoolConfigFile =
            toml::from_str(content).map_err(|e| PoolError::Config(e.to_string()))?;
        file.into_config()
    }

    /// Load and parse a `pool.toml` file from disk.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(Self::from_toml_str(&content)?)
    }
}

/// TOML representation of [`PoolConfig`]. Absent fields take the defaults.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolConfigFile {
    pub max_connection: Option<usize>,
    pub connect_retry_count: Option<u32>,
    pub reconnect_wait_time: Option<String>,
    pub idle_timeout: Option<String>,
    pub short_connect_idle_timeout: Option<String>,
    pub idle_queue_per_max_clear_count: Option<usize>,
    pub dns_cache_update_duration: Option<String>,
    pub max_connection_life_time: Option<String>,
    pub max_wait: Option<String>,
}

impl PoolConfigFile {
    /// Resolve optional fields against the defaults and validate the result.
    pub fn into_config(self) -> PoolResult<PoolConfig> {
        let defaults = PoolConfig::default();

        let config = PoolConfig {
            max_connection: self.max_connection.unwrap_or(defaults.max_connection),
            connect_retry_count: self
                .connect_retry_count
                .unwrap_or(defaults.connect_retry_count),
            reconnect_wait_time: duration_field(
                "reconnect_wait_time",
                self.reconnect_wait_time,
                defaults.reconnect_wait_time,
            )?,
            idle_timeout: duration_field("idle_timeout", self.idle_timeout, defaults.idle_timeout)?,
            short_connect_idle_timeout: duration_field(
                "short_connect_idle_timeout",
                self.short_connect_idle_timeout,
                defaults.short_connect_idle_timeout,
            )?,
            idle_queue_per_max_clear_count: self
                .idle_queue_per_max_clear_count
                .unwrap_or(defaults.idle_queue_per_max_clear_count),
            dns_cache_update_duration: match self.dns_cache_update_duration {
                Some(raw) => DnsRefresh::from_millis(
                    parse_signed_millis(&raw).ok_or_else(|| invalid_duration("dns_cache_update_duration", &raw))?,
                ),
                None => defaults.dns_cache_update_duration,
            },
            max_connection_life_time: match self.max_connection_life_time {
                Some(raw) => {
                    let life = parse_duration(&raw)
                        .ok_or_else(|| invalid_duration("max_connection_life_time", &raw))?;
                    (!life.is_zero()).then_some(life)
                }
                None => defaults.max_connection_life_time,
            },
            max_wait: match self.max_wait {
                Some(raw) => Some(parse_duration(&raw).ok_or_else(|| invalid_duration("max_wait", &raw))?),
                None => defaults.max_wait,
            },
        };

        config.validate()?;
        Ok(config)
    }
}

fn duration_field(name: &str, raw: Option<String>, default: Duration) -> PoolResult<Duration> {
    match raw {
        Some(raw) => parse_duration(&raw).ok_or_else(|| invalid_duration(name, &raw)),
        None => Ok(default),
    }
}

fn invalid_duration(name: &str, raw: &str) -> PoolError {
    PoolError::Config(format!("{name}: invalid duration {raw:?}"))
}

/// Parse a duration string like "5s", "500ms", "1m". A bare number is seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins
            .parse::<u64>()
            .ok()
            .and_then(|m| m.checked_mul(60))
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Like [`parse_duration`] but accepts a leading `-`, returning milliseconds.
fn parse_signed_millis(s: &str) -> Option<i64> {
    let s = s.trim();
    let (negative, magnitude) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let millis = i64::try_from(parse_duration(magnitude)?.as_millis()).ok()?;
    Some(if negative { -millis } else { millis })
}
