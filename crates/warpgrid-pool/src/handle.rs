//! Connection handle: one pooled client plus its bookkeeping.

use std::time::Duration;

use tokio::time::Instant;

use crate::client::PoolClient;

/// Where a handle currently is in its borrow/return cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleState {
    /// Sitting in the free set.
    Free,
    /// Lent to exactly one in-flight caller.
    Borrowed,
    /// Failed or closed; will be destroyed instead of re-pooled.
    Invalid,
}

/// A pooled client with creation/return timestamps and a reuse counter.
///
/// The handle does not prevent double borrows on its own; the pool's
/// free-set discipline does. Dropping a handle closes its client.
#[derive(Debug)]
pub struct ConnectionHandle<C: PoolClient> {
    client: C,
    created_at: Instant,
    last_returned: Instant,
    /// Times this handle was taken back out of the free set.
    reuses: u64,
    /// Returned into a free set already larger than the outstanding demand.
    surplus: bool,
    state: HandleState,
}

impl<C: PoolClient> ConnectionHandle<C> {
    /// Wrap a freshly connected client. New handles start out borrowed by
    /// the request that created them.
    pub(crate) fn new(client: C) -> Self {
        let now = Instant::now();
        Self {
            client,
            created_at: now,
            last_returned: now,
            reuses: 0,
            surplus: false,
            state: HandleState::Borrowed,
        }
    }

    /// Take a free handle out for one caller.
    pub fn acquire(&mut self) -> &mut C {
        debug_assert_eq!(self.state, HandleState::Free, "acquire on a non-free handle");
        self.state = HandleState::Borrowed;
        self.reuses += 1;
        self.surplus = false;
        &mut self.client
    }

    /// Hand the client back.
    ///
    /// Returns `true` when the handle may go back to the free set: the
    /// caller reported success and the client is still open. Otherwise the
    /// handle becomes [`HandleState::Invalid`].
    pub fn release(&mut self, success: bool) -> bool {
        debug_assert_eq!(self.state, HandleState::Borrowed, "release on a non-borrowed handle");
        if success && !self.client.is_closed() {
            self.state = HandleState::Free;
            self.last_returned = Instant::now();
            true
        } else {
            self.state = HandleState::Invalid;
            false
        }
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut C {
        &mut self.client
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_returned(&self) -> Instant {
        self.last_returned
    }

    /// Whether the handle has only ever served the request that created it.
    pub fn is_unreused(&self) -> bool {
        self.reuses == 0
    }

    /// Flag a free handle as beyond what current demand needs.
    pub(crate) fn mark_surplus(&mut self) {
        self.surplus = true;
    }

    /// Whether the short idle timeout applies: the handle has never been
    /// reused and came back while the free set already outnumbered the
    /// clients still lent out.
    pub fn is_surplus(&self) -> bool {
        self.surplus && self.is_unreused()
    }

    /// Idle threshold that applies to this handle.
    ///
    /// Surplus handles use the shorter `short_idle`; everything else uses
    /// `idle`.
    pub fn idle_threshold(&self, idle: Duration, short_idle: Duration) -> Duration {
        if self.is_surplus() {
            short_idle.min(idle)
        } else {
            idle
        }
    }

    /// Whether a free handle has been idle past its threshold at `now`.
    pub fn idle_expired(&self, now: Instant, idle: Duration, short_idle: Duration) -> bool {
        now.saturating_duration_since(self.last_returned) > self.idle_threshold(idle, short_idle)
    }

    /// Whether the handle has outlived `max_life` at `now`. `None` never expires.
    pub fn life_expired(&self, now: Instant, max_life: Option<Duration>) -> bool {
        max_life.is_some_and(|life| now.saturating_duration_since(self.created_at) > life)
    }
}

impl<C: PoolClient> Drop for ConnectionHandle<C> {
    fn drop(&mut self) {
        if !self.client.is_closed() {
            self.client.close();
        }
    }
}
