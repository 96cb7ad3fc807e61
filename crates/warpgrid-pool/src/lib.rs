//! warpgrid-pool: per-destination client connection pooling.
//!
//! Keeps connected clients to remote destinations and lends them out one
//! request at a time:
//!
//! - **Reuse**: clients go back to a free set after each request and are
//!   handed out most-recently-returned first
//! - **Capacity**: at most `max_connection` clients per destination; callers
//!   beyond that wait for a return
//! - **Reconnect**: failed connects are retried on a fixed cadence measured
//!   from attempt start times
//! - **Eviction**: a background sweep closes idle and over-age clients
//! - **DNS caching**: resolved endpoints are shared as immutable snapshots
//!   and refreshed per the configured policy
//! - **Registry**: [`ClientPools`] creates one pool per destination key on
//!   first access
//!
//! # Architecture
//!
//! ```text
//! ClientPools (DashMap<key, Arc<ClientPool>>)
//!   └── ClientPool
//!         ├── Slots: free set + permits + counters (shared with the sweeper)
//!         ├── EndpointCache: ArcSwap<EndpointSnapshot> + single-flight refresh
//!         ├── ClientFactory: creates unconnected clients
//!         └── sweeper task (idle / lifetime eviction)
//! ```
//!
//! Clients are anything implementing [`PoolClient`]; [`TcpClient`] is a
//! ready-made raw TCP implementation.

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod pool;
pub mod registry;
pub mod tcp;

pub use client::{BoxFuture, ClientFactory, PoolClient};
pub use config::{DnsRefresh, PoolConfig, PoolConfigFile};
pub use endpoint::{
    Destination, EndpointCache, EndpointSnapshot, Resolve, StaticResolver, SystemResolver,
};
pub use error::{ClientError, PoolError, PoolResult};
pub use handle::{ConnectionHandle, HandleState};
pub use pool::{ClientPool, PoolStats, PooledClient, RetryPolicy};
pub use registry::ClientPools;
pub use tcp::TcpClient;
