//! Background eviction of idle and over-age clients.

use std::sync::Weak;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use super::Slots;
use crate::client::PoolClient;
use crate::handle::ConnectionHandle;

impl<C: PoolClient> Slots<C> {
    fn should_evict(&self, handle: &ConnectionHandle<C>, now: Instant) -> bool {
        let config = &self.config;
        handle.client().is_closed()
            || handle.idle_expired(now, config.idle_timeout, config.short_connect_idle_timeout)
            || handle.life_expired(now, config.max_connection_life_time)
    }

    /// Remove expired handles from the free set, oldest first, at most
    /// `idle_queue_per_max_clear_count` per call. Returns how many went.
    pub(crate) fn sweep(&self, now: Instant) -> usize {
        let limit = self.config.idle_queue_per_max_clear_count;
        let expired = {
            let mut free = self.lock_free();
            let mut expired = Vec::new();
            let mut i = 0;
            while i < free.len() && expired.len() < limit {
                if self.should_evict(&free[i], now) {
                    expired.extend(free.remove(i));
                } else {
                    i += 1;
                }
            }
            expired
        };

        let count = expired.len();
        if count > 0 {
            self.created.fetch_sub(count, Ordering::AcqRel);
            self.evicted.fetch_add(count as u64, Ordering::Relaxed);
            drop(expired);
        }
        count
    }
}

/// Run [`Slots::sweep`] every `period` until shutdown is signalled or the
/// pool is gone.
pub(super) fn spawn_sweeper<C: PoolClient>(
    runtime: &Handle,
    slots: Weak<Slots<C>>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    runtime.spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let Some(slots) = slots.upgrade() else { break };
                    if slots.is_closed() {
                        break;
                    }
                    let evicted = slots.sweep(Instant::now());
                    if evicted > 0 {
                        tracing::info!(
                            host = %slots.host,
                            evicted,
                            remaining_idle = slots.lock_free().len(),
                            "evicted idle connections"
                        );
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("idle sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::tests::{MockNetwork, hold_concurrently, make_pool, test_config};

    #[tokio::test(start_paused = true)]
    async fn idle_clients_are_evicted() {
        let net = MockNetwork::up();
        let pool = make_pool(
            PoolConfig {
                idle_timeout: Duration::from_millis(300),
                short_connect_idle_timeout: Duration::from_millis(300),
                ..test_config()
            },
            &net,
        );
        hold_concurrently(&pool, 5, false).await;
        assert_eq!(pool.free_client_count(), 5);

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(pool.free_client_count(), 0);
        let stats = pool.stats();
        assert_eq!(stats.evicted, 5);
        assert_eq!(stats.created, 0);
        assert_eq!(net.closes(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_clients_survive_a_sweep() {
        let pool = make_pool(test_config(), &MockNetwork::up());
        hold_concurrently(&pool, 3, false).await;
        assert_eq!(pool.slots.sweep(Instant::now()), 0);
        assert_eq!(pool.free_client_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surplus_clients_use_short_idle_timeout() {
        let pool = make_pool(
            PoolConfig {
                idle_timeout: Duration::from_millis(700),
                short_connect_idle_timeout: Duration::from_millis(200),
                ..test_config()
            },
            &MockNetwork::up(),
        );
        // The last two of four returns outnumber the clients still out.
        hold_concurrently(&pool, 4, false).await;
        // Reuses the most recently returned (surplus) client.
        pool.send_request(|_| Box::pin(async {})).await.unwrap();
        assert_eq!(pool.free_client_count(), 4);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pool.free_client_count(), 3);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(pool.free_client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn burst_sheds_down_to_half_then_drains() {
        let pool = make_pool(
            PoolConfig {
                max_connection: 200,
                idle_timeout: Duration::from_millis(700),
                short_connect_idle_timeout: Duration::from_millis(200),
                ..test_config()
            },
            &MockNetwork::up(),
        );
        hold_concurrently(&pool, 200, false).await;
        assert_eq!(pool.free_client_count(), 200);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(pool.free_client_count(), 100);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(pool.free_client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn low_request_rate_keeps_its_connection() {
        let net = MockNetwork::up();
        let pool = make_pool(PoolConfig::default(), &net);

        for _ in 0..5 {
            pool.send_request(|_| Box::pin(async {})).await.unwrap();
            tokio::time::sleep(Duration::from_millis(2200)).await;
        }

        assert_eq!(net.connects(), 1);
        assert_eq!(pool.free_client_count(), 1);
        assert_eq!(pool.stats().evicted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_is_bounded_per_pass() {
        let pool = make_pool(
            PoolConfig {
                idle_queue_per_max_clear_count: 2,
                ..test_config()
            },
            &MockNetwork::up(),
        );
        hold_concurrently(&pool, 5, false).await;

        let later = Instant::now() + Duration::from_secs(31);
        assert_eq!(pool.slots.sweep(later), 2);
        assert_eq!(pool.slots.sweep(later), 2);
        assert_eq!(pool.slots.sweep(later), 1);
        assert_eq!(pool.slots.sweep(later), 0);
        assert_eq!(pool.stats().evicted, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_sweeps_drain_over_several_ticks() {
        let pool = make_pool(
            PoolConfig {
                idle_timeout: Duration::from_millis(100),
                short_connect_idle_timeout: Duration::from_millis(100),
                idle_queue_per_max_clear_count: 1,
                ..test_config()
            },
            &MockNetwork::up(),
        );
        hold_concurrently(&pool, 5, false).await;

        tokio::time::sleep(Duration::from_millis(160)).await;
        let after_first_expiry = pool.free_client_count();
        assert!(after_first_expiry >= 4, "{after_first_expiry}");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(pool.free_client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_clients_past_life_time_are_evicted() {
        let pool = make_pool(
            PoolConfig {
                max_connection_life_time: Some(Duration::from_secs(1)),
                ..test_config()
            },
            &MockNetwork::up(),
        );
        hold_concurrently(&pool, 2, false).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pool.free_client_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_exits_when_pool_dropped() {
        let net = MockNetwork::up();
        let pool = make_pool(test_config(), &net);
        let weak = Arc::downgrade(&pool.slots);
        drop(pool);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(weak.upgrade().is_none());
    }
}
