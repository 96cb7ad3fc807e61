//! Client capability set consumed by the pool.
//!
//! The pool never speaks a wire protocol. It only needs to connect a client,
//! ask whether it is still usable, and close it. Anything exposing those
//! operations can be pooled: RPC clients, HTTP clients, raw TCP streams.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use crate::error::ClientError;

/// A boxed, sendable future borrowing from `'a`.
///
/// Work passed to [`ClientPool::send_request`](crate::pool::ClientPool::send_request)
/// returns one of these so it can borrow the pooled client across `.await`s.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A network client that can be pooled.
///
/// One client object is created per connection slot and reused across
/// connect retries, so `connect` may be called again after it fails.
pub trait PoolClient: Send + 'static {
    /// Establish the connection to `host_name` using the resolved `endpoints`.
    ///
    /// `endpoints` is the pool's current snapshot. Implementations typically
    /// try them in order.
    fn connect(
        &mut self,
        host_name: &str,
        endpoints: &[SocketAddr],
    ) -> impl Future<Output = Result<(), ClientError>> + Send;

    /// Close the underlying transport. Must be idempotent and must not fail.
    fn close(&mut self);

    /// Whether the client has been closed, by the pool, by the caller's work,
    /// or by the remote end. Checked when a client is returned and before a
    /// free one is lent out, so it must not block.
    fn is_closed(&self) -> bool;

    /// The destination this client was created for.
    fn host_name(&self) -> &str;
}

/// Creates fresh, unconnected clients for a destination.
///
/// Injected into the pool for testability. Any `Fn(&str) -> C` closure
/// is a factory.
pub trait ClientFactory<C>: Send + Sync {
    fn create(&self, host_name: &str) -> C;
}

impl<C, F> ClientFactory<C> for F
where
    F: Fn(&str) -> C + Send + Sync,
{
    fn create(&self, host_name: &str) -> C {
        self(host_name)
    }
}
