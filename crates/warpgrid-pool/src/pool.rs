//! Single-destination client pool.
//!
//! Owns a bounded set of connected clients for one destination, lends one
//! out per request, and takes it back afterwards.
//!
//! # Architecture
//!
//! ```text
//! send_request(work)
//!   → acquire a slot permit (waits at max_connection, optionally bounded by max_wait)
//!     → free handle available → reuse it
//!     → free set empty → resolve endpoints (EndpointCache) → connect with retry
//!   → run work against the client
//!   → client still open → back to the free set
//!   → client closed, work cancelled, or pool torn down → destroy
//! ```
//!
//! A background sweeper evicts idle and over-age handles from the free set.
//! All shared state lives in short critical sections; connects and
//! resolutions run outside any lock.

mod eviction;
mod reconnect;

use std::collections::VecDeque;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError, watch};
use tokio::time::Instant;

use crate::client::{BoxFuture, ClientFactory, PoolClient};
use crate::config::PoolConfig;
use crate::endpoint::{EndpointCache, EndpointSnapshot, Resolve, SystemResolver};
use crate::error::{PoolError, PoolResult};
use crate::handle::ConnectionHandle;

pub use reconnect::RetryPolicy;

/// Point-in-time counters for one pool.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Handles sitting in the free set.
    pub free: usize,
    /// Handles lent out to callers.
    pub borrowed: usize,
    /// Live handles (free + borrowed).
    pub created: usize,
    /// Callers waiting for a slot at capacity.
    pub waiting: usize,
    /// Failed connect attempts since the pool was created.
    pub connect_failures: u64,
    /// Handles removed by the idle/lifetime sweep.
    pub evicted: u64,
}

/// State shared between the pool, its borrowed clients, and the sweeper.
pub(crate) struct Slots<C: PoolClient> {
    host: String,
    config: PoolConfig,
    free: Mutex<VecDeque<ConnectionHandle<C>>>,
    /// One permit per handle that may be borrowed or in the middle of connecting.
    permits: Arc<Semaphore>,
    created: AtomicUsize,
    waiting: AtomicUsize,
    connect_failures: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicBool,
}

impl<C: PoolClient> Slots<C> {
    fn new(host: &str, config: PoolConfig) -> Self {
        Self {
            host: host.to_string(),
            permits: Arc::new(Semaphore::new(config.max_connection)),
            config,
            free: Mutex::new(VecDeque::new()),
            created: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            connect_failures: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn lock_free(&self) -> MutexGuard<'_, VecDeque<ConnectionHandle<C>>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pop the most recently returned usable handle, destroying any closed
    /// or over-age handles found on the way.
    fn take_free(&self) -> Option<ConnectionHandle<C>> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut free = self.lock_free();
            loop {
                match free.pop_back() {
                    Some(handle)
                        if handle.client().is_closed()
                            || handle.life_expired(now, self.config.max_connection_life_time) =>
                    {
                        stale.push(handle);
                    }
                    other => break other,
                }
            }
        };
        for handle in stale {
            self.destroy(handle, "stale on checkout");
        }
        found
    }

    /// Return a borrowed handle, re-pooling it when it is still usable.
    ///
    /// A handle arriving while the free set already holds more clients than
    /// are still lent out is surplus to current demand and gets the short
    /// idle timeout until it is reused.
    fn give_back(&self, mut handle: ConnectionHandle<C>, success: bool) {
        if !handle.release(success) {
            self.destroy(handle, "closed by caller");
            return;
        }
        if handle.life_expired(Instant::now(), self.config.max_connection_life_time) {
            self.destroy(handle, "exceeded max connection life time");
            return;
        }

        let rejected = {
            let mut free = self.lock_free();
            if self.is_closed() {
                Some(handle)
            } else {
                // Clients still lent out, not counting the one coming back.
                let lent = self
                    .created
                    .load(Ordering::Acquire)
                    .saturating_sub(free.len() + 1);
                if free.len() > lent {
                    handle.mark_surplus();
                }
                free.push_back(handle);
                tracing::debug!(host = %self.host, idle = free.len(), "returned client to pool");
                None
            }
        };
        if let Some(handle) = rejected {
            self.destroy(handle, "pool closed");
        }
    }

    fn destroy(&self, handle: ConnectionHandle<C>, reason: &'static str) {
        self.created.fetch_sub(1, Ordering::AcqRel);
        drop(handle);
        tracing::debug!(host = %self.host, reason, "destroyed client");
    }
}

/// Decrements the waiting counter however the wait ends.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// A client checked out of a [`ClientPool`].
///
/// Dereferences to the client. Dropping it returns the client to the free
/// set if the client is still open and the pool is alive; otherwise the
/// client is destroyed.
pub struct PooledClient<C: PoolClient> {
    // Taken exactly once, in Drop.
    handle: ManuallyDrop<ConnectionHandle<C>>,
    slots: Arc<Slots<C>>,
    healthy: bool,
    // Released after `handle` goes back to the free set (see Drop).
    _permit: OwnedSemaphorePermit,
}

impl<C: PoolClient> PooledClient<C> {
    /// Mark the client unusable; it is destroyed instead of re-pooled.
    pub fn discard(&mut self) {
        self.healthy = false;
    }

    /// When the underlying connection was established.
    pub fn created_at(&self) -> Instant {
        self.handle.created_at()
    }
}

impl<C: PoolClient> Deref for PooledClient<C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.handle.client()
    }
}

impl<C: PoolClient> DerefMut for PooledClient<C> {
    fn deref_mut(&mut self) -> &mut C {
        self.handle.client_mut()
    }
}

impl<C: PoolClient> Drop for PooledClient<C> {
    fn drop(&mut self) {
        // SAFETY: `handle` is never touched again after this point.
        let handle = unsafe { ManuallyDrop::take(&mut self.handle) };
        self.slots.give_back(handle, self.healthy);
    }
}

impl<C: PoolClient + std::fmt::Debug> std::fmt::Debug for PooledClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("host", &self.slots.host)
            .field("client", self.handle.client())
            .field("healthy", &self.healthy)
            .finish()
    }
}

/// Connection pool for a single destination.
pub struct ClientPool<C: PoolClient, R = SystemResolver> {
    slots: Arc<Slots<C>>,
    endpoints: EndpointCache<R>,
    factory: Arc<dyn ClientFactory<C>>,
    shutdown: watch::Sender<bool>,
}

impl<C: PoolClient> ClientPool<C, SystemResolver> {
    /// Create a pool resolving through system DNS, sweeping on the current runtime.
    pub fn create<F>(host_name: &str, config: PoolConfig, factory: F) -> PoolResult<Arc<Self>>
    where
        F: ClientFactory<C> + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| PoolError::NoRuntime(e.to_string()))?;
        Self::create_with(host_name, config, Arc::new(factory), SystemResolver, &runtime)
    }
}

impl<C: PoolClient, R: Resolve> ClientPool<C, R> {
    /// Create a pool with an explicit resolver and runtime for the sweeper.
    pub fn create_with(
        host_name: &str,
        config: PoolConfig,
        factory: Arc<dyn ClientFactory<C>>,
        resolver: R,
        runtime: &Handle,
    ) -> PoolResult<Arc<Self>> {
        config.validate()?;
        Ok(Self::build(host_name, config, factory, resolver, runtime))
    }

    /// Construct from an already validated configuration.
    pub(crate) fn build(
        host_name: &str,
        config: PoolConfig,
        factory: Arc<dyn ClientFactory<C>>,
        resolver: R,
        runtime: &Handle,
    ) -> Arc<Self> {
        let interval = config.sweep_interval();
        let endpoints = EndpointCache::new(host_name, resolver, config.dns_cache_update_duration);
        let slots = Arc::new(Slots::new(host_name, config));
        let (shutdown, shutdown_rx) = watch::channel(false);

        eviction::spawn_sweeper(runtime, Arc::downgrade(&slots), interval, shutdown_rx);

        tracing::debug!(
            host = %host_name,
            max_connection = slots.config.max_connection,
            sweep_interval = ?interval,
            "created client pool"
        );

        Arc::new(Self {
            slots,
            endpoints,
            factory,
            shutdown,
        })
    }

    /// Run `work` against a pooled client.
    ///
    /// The client goes back to the free set once `work` completes, unless
    /// `work` closed it. If the returned future is dropped before `work`
    /// completes, the client is destroyed since its protocol state is unknown.
    pub async fn send_request<T, F>(&self, work: F) -> PoolResult<T>
    where
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, T>,
    {
        let mut client = self.checkout().await?;
        client.healthy = false;
        let output = work(&mut *client).await;
        client.healthy = true;
        Ok(output)
    }

    /// Borrow a client for the lifetime of the returned guard.
    pub async fn checkout(&self) -> PoolResult<PooledClient<C>> {
        if self.slots.is_closed() {
            return Err(self.closed_error());
        }

        let permit = self.acquire_permit().await?;

        if let Some(mut handle) = self.slots.take_free() {
            handle.acquire();
            tracing::debug!(host = %self.slots.host, "reused idle client");
            return Ok(self.lend(handle, permit));
        }

        let client = self.connect_with_retry().await?;
        self.slots.created.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(
            host = %self.slots.host,
            created = self.slots.created.load(Ordering::Relaxed),
            "created new client"
        );
        Ok(self.lend(ConnectionHandle::new(client), permit))
    }

    fn lend(&self, handle: ConnectionHandle<C>, permit: OwnedSemaphorePermit) -> PooledClient<C> {
        PooledClient {
            handle: ManuallyDrop::new(handle),
            slots: Arc::clone(&self.slots),
            healthy: true,
            _permit: permit,
        }
    }

    async fn acquire_permit(&self) -> PoolResult<OwnedSemaphorePermit> {
        let permits = Arc::clone(&self.slots.permits);
        match Arc::clone(&permits).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) => return Err(self.closed_error()),
            Err(TryAcquireError::NoPermits) => {}
        }

        let _waiting = WaitingGuard::enter(&self.slots.waiting);
        let started = Instant::now();
        let acquired = match self.slots.config.max_wait {
            Some(limit) => tokio::time::timeout(limit, permits.acquire_owned())
                .await
                .map_err(|_| PoolError::Exhausted {
                    host: self.slots.host.clone(),
                    waited: started.elapsed(),
                })?,
            None => permits.acquire_owned().await,
        };
        acquired.map_err(|_| self.closed_error())
    }

    fn closed_error(&self) -> PoolError {
        PoolError::Closed {
            host: self.slots.host.clone(),
        }
    }

    /// Number of idle clients. Approximate under concurrency.
    pub fn free_client_count(&self) -> usize {
        self.slots.lock_free().len()
    }

    /// Current endpoint snapshot, without triggering a refresh.
    pub fn get_remote_endpoints(&self) -> Arc<EndpointSnapshot> {
        self.endpoints.snapshot()
    }

    /// The destination this pool serves.
    pub fn host_name(&self) -> &str {
        &self.slots.host
    }

    pub fn config(&self) -> &PoolConfig {
        &self.slots.config
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    pub fn stats(&self) -> PoolStats {
        let free = self.free_client_count();
        let created = self.slots.created.load(Ordering::Acquire);
        PoolStats {
            free,
            borrowed: created.saturating_sub(free),
            created,
            waiting: self.slots.waiting.load(Ordering::Relaxed),
            connect_failures: self.slots.connect_failures.load(Ordering::Relaxed),
            evicted: self.slots.evicted.load(Ordering::Relaxed),
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        tracing::info!(
            host = %self.slots.host,
            free = stats.free,
            borrowed = stats.borrowed,
            created = stats.created,
            waiting = stats.waiting,
            connect_failures = stats.connect_failures,
            evicted = stats.evicted,
            resolutions = self.endpoints.resolutions(),
            "client pool statistics"
        );
    }
}

impl<C: PoolClient, R> ClientPool<C, R> {
    /// Tear the pool down: stop the sweeper, wake waiters with
    /// [`PoolError::Closed`], and close every idle client.
    ///
    /// Clients still borrowed are destroyed when their borrowers return them.
    pub fn shutdown(&self) {
        if let Some(closed) = self.teardown() {
            tracing::info!(host = %self.slots.host, closed, "client pool shut down");
        }
    }

    /// Returns the number of idle clients closed, or `None` if already torn down.
    fn teardown(&self) -> Option<usize> {
        if self.slots.closed.swap(true, Ordering::AcqRel) {
            return None;
        }
        let _ = self.shutdown.send(true);
        self.slots.permits.close();

        let drained: Vec<_> = self.slots.lock_free().drain(..).collect();
        let closed = drained.len();
        self.slots.created.fetch_sub(closed, Ordering::AcqRel);
        drop(drained);
        Some(closed)
    }
}

impl<C: PoolClient, R> Drop for ClientPool<C, R> {
    fn drop(&mut self) {
        if let Some(closed) = self.teardown() {
            tracing::debug!(host = %self.slots.host, closed, "client pool dropped");
        }
    }
}

impl<C: PoolClient, R> std::fmt::Debug for ClientPool<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPool")
            .field("host", &self.slots.host)
            .field("config", &self.slots.config)
            .field("closed", &self.slots.is_closed())
            .finish_non_exhaustive()
    }
}
