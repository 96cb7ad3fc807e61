//! Connect with fixed-cadence retry.
//!
//! Attempt `k` starts `k * period` after the first attempt, not `period`
//! after attempt `k - 1` finished: a slow failure eats into the wait
//! before the next attempt instead of stacking on top of it.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

use super::ClientPool;
use crate::client::PoolClient;
use crate::endpoint::Resolve;
use crate::error::{ClientError, PoolError, PoolResult};

/// Attempt budget and cadence for establishing one connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Interval between attempt start times.
    pub period: Duration,
}

impl RetryPolicy {
    pub fn new(retry_count: u32, period: Duration) -> Self {
        Self {
            attempts: retry_count.saturating_add(1),
            period,
        }
    }

    /// How long to sleep after an attempt that started at `started` and
    /// failed at `now`.
    pub fn wait_after(&self, started: Instant, now: Instant) -> Duration {
        self.period
            .saturating_sub(now.saturating_duration_since(started))
    }
}

impl<C: PoolClient, R: Resolve> ClientPool<C, R> {
    /// Create one client and connect it, retrying per the pool's policy.
    ///
    /// Every attempt re-reads the endpoint cache, so a refresh between
    /// attempts is picked up.
    pub(super) async fn connect_with_retry(&self) -> PoolResult<C> {
        let config = &self.slots.config;
        let policy = RetryPolicy::new(config.connect_retry_count, config.reconnect_wait_time);
        let host = self.slots.host.as_str();
        let mut client = self.factory.create(host);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();

            let endpoints = self.endpoints.get().await;
            let result = if endpoints.is_empty() {
                Err(ClientError::NoEndpoints)
            } else {
                client.connect(host, &endpoints).await
            };

            let error = match result {
                Ok(()) => {
                    if attempt > 1 {
                        tracing::info!(host, attempt, "connected after retry");
                    }
                    return Ok(client);
                }
                Err(e) => e,
            };

            self.slots.connect_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                host,
                attempt,
                max_attempts = policy.attempts,
                error = %error,
                "connect attempt failed"
            );

            if attempt >= policy.attempts {
                client.close();
                return Err(match error {
                    ClientError::NoEndpoints => PoolError::Resolve {
                        host: host.to_string(),
                    },
                    source => PoolError::Connect {
                        host: host.to_string(),
                        attempts: attempt,
                        source,
                    },
                });
            }
            if self.slots.is_closed() {
                client.close();
                return Err(self.closed_error());
            }

            let wait = policy.wait_after(started, Instant::now());
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}
