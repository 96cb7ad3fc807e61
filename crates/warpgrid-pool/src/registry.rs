//! Keyed registry of client pools.
//!
//! [`ClientPools`] hands out one [`ClientPool`] per destination key,
//! creating it on first use. Lookups of existing keys never block on each
//! other; creation of a new key only contends with other accesses to the
//! same shard.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::runtime::Handle;

use crate::client::{BoxFuture, ClientFactory, PoolClient};
use crate::config::PoolConfig;
use crate::endpoint::{Resolve, SystemResolver};
use crate::error::{PoolError, PoolResult};
use crate::pool::ClientPool;

/// Lazily populated map of destination key to pool.
///
/// Every pool shares the registry's configuration, factory, resolver, and
/// runtime. Pools live until removed or until the registry is dropped.
pub struct ClientPools<C: PoolClient, R = SystemResolver> {
    pools: DashMap<String, Arc<ClientPool<C, R>>>,
    config: PoolConfig,
    factory: Arc<dyn ClientFactory<C>>,
    resolver: R,
    runtime: Handle,
}

impl<C: PoolClient> ClientPools<C, SystemResolver> {
    /// Registry resolving through system DNS, sweeping on the current runtime.
    pub fn new<F>(config: PoolConfig, factory: F) -> PoolResult<Self>
    where
        F: ClientFactory<C> + 'static,
    {
        let runtime = Handle::try_current().map_err(|e| PoolError::NoRuntime(e.to_string()))?;
        Self::with_resolver(config, Arc::new(factory), SystemResolver, runtime)
    }
}

impl<C: PoolClient, R: Resolve + Clone> ClientPools<C, R> {
    /// Registry with an explicit resolver and runtime.
    ///
    /// The configuration is validated once here so that per-key creation
    /// cannot fail.
    pub fn with_resolver(
        config: PoolConfig,
        factory: Arc<dyn ClientFactory<C>>,
        resolver: R,
        runtime: Handle,
    ) -> PoolResult<Self> {
        config.validate()?;
        Ok(Self {
            pools: DashMap::new(),
            config,
            factory,
            resolver,
            runtime,
        })
    }

    /// The pool for `key`, created on first access.
    ///
    /// Concurrent first accesses of the same key all observe the same pool.
    pub fn get(&self, key: &str) -> Arc<ClientPool<C, R>> {
        if let Some(pool) = self.pools.get(key) {
            return Arc::clone(pool.value());
        }

        let pool = self.pools.entry(key.to_string()).or_insert_with(|| {
            tracing::debug!(key, "creating client pool");
            ClientPool::build(
                key,
                self.config.clone(),
                Arc::clone(&self.factory),
                self.resolver.clone(),
                &self.runtime,
            )
        });
        Arc::clone(pool.value())
    }

    /// The pool for `key`, created with `config` instead of the shared
    /// configuration if it does not exist yet. An existing pool is returned
    /// unchanged.
    pub fn get_or_create_with(
        &self,
        key: &str,
        config: PoolConfig,
    ) -> PoolResult<Arc<ClientPool<C, R>>> {
        if let Some(pool) = self.pools.get(key) {
            return Ok(Arc::clone(pool.value()));
        }
        config.validate()?;

        let pool = self.pools.entry(key.to_string()).or_insert_with(|| {
            tracing::debug!(key, "creating client pool with dedicated config");
            ClientPool::build(
                key,
                config,
                Arc::clone(&self.factory),
                self.resolver.clone(),
                &self.runtime,
            )
        });
        Ok(Arc::clone(pool.value()))
    }

    /// Run `work` against a pooled client for `key`.
    pub async fn send_request<T, F>(&self, key: &str, work: F) -> PoolResult<T>
    where
        F: for<'c> FnOnce(&'c mut C) -> BoxFuture<'c, T>,
    {
        self.get(key).send_request(work).await
    }
}

impl<C: PoolClient, R> ClientPools<C, R> {
    /// Existing pool for `key`, without creating one.
    pub fn existing(&self, key: &str) -> Option<Arc<ClientPool<C, R>>> {
        self.pools.get(key).map(|pool| Arc::clone(pool.value()))
    }

    /// Remove and shut down the pool for `key`.
    ///
    /// Callers still holding the pool keep it alive, but it rejects new
    /// requests. A later [`get`](Self::get) creates a fresh pool.
    pub fn remove(&self, key: &str) -> bool {
        match self.pools.remove(key) {
            Some((_, pool)) => {
                pool.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.pools.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Snapshot of the registered keys, in no particular order.
    pub fn keys(&self) -> Vec<String> {
        self.pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Shut down every registered pool and clear the registry.
    pub fn shutdown(&self) {
        let keys = self.keys();
        for key in &keys {
            self.remove(key);
        }
        tracing::info!(pools = keys.len(), "client pool registry shut down");
    }
}

impl<C: PoolClient, R> std::fmt::Debug for ClientPools<C, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientPools")
            .field("pools", &self.pools.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::net::{Ipv4Addr, SocketAddr};

    use crate::endpoint::StaticResolver;
    use crate::pool::tests::{MockClient, MockNetwork, test_config};

    fn resolver_for(keys: &[&str]) -> StaticResolver {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 9000));
        StaticResolver::new(keys.iter().map(|k| (k.to_string(), vec![addr])).collect())
    }

    fn registry(
        resolver: StaticResolver,
    ) -> (ClientPools<MockClient, StaticResolver>, Arc<MockNetwork>) {
        let net = MockNetwork::up();
        let pools = ClientPools::with_resolver(
            test_config(),
            MockClient::factory(&net),
            resolver,
            Handle::current(),
        )
        .unwrap();
        (pools, net)
    }

    #[tokio::test]
    async fn same_key_returns_same_pool() {
        let (pools, _) = registry(resolver_for(&[]));
        let a = pools.get("db.warp.local:5432");
        let b = pools.get("db.warp.local:5432");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pools.len(), 1);
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_pools() {
        let (pools, _) = registry(resolver_for(&[]));
        let a = pools.get("a:1");
        let b = pools.get("b:1");
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(a.host_name(), "a:1");
        assert_eq!(b.host_name(), "b:1");
    }

    #[tokio::test]
    async fn pools_are_created_lazily() {
        let (pools, _) = registry(resolver_for(&[]));
        assert!(pools.is_empty());
        assert!(pools.existing("a:1").is_none());
        pools.get("a:1");
        assert!(pools.contains("a:1"));
        assert!(pools.existing("a:1").is_some());
    }

    #[tokio::test]
    async fn invalid_config_rejected_up_front() {
        let net = MockNetwork::up();
        let result = ClientPools::with_resolver(
            PoolConfig {
                idle_queue_per_max_clear_count: 0,
                ..test_config()
            },
            MockClient::factory(&net),
            resolver_for(&[]),
            Handle::current(),
        );
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn dedicated_config_applies_only_on_creation() {
        let (pools, _) = registry(resolver_for(&[]));
        let small = PoolConfig {
            max_connection: 2,
            ..test_config()
        };
        let a = pools.get_or_create_with("a:1", small.clone()).unwrap();
        assert_eq!(a.config().max_connection, 2);
        assert!(Arc::ptr_eq(&a, &pools.get("a:1")));

        let b = pools.get("b:1");
        let again = pools.get_or_create_with("b:1", small).unwrap();
        assert!(Arc::ptr_eq(&b, &again));
        assert_eq!(again.config().max_connection, 100);

        let invalid = PoolConfig {
            max_connection: 0,
            ..test_config()
        };
        assert!(pools.get_or_create_with("c:1", invalid).is_err());
        assert!(!pools.contains("c:1"));
    }

    #[tokio::test]
    async fn send_request_routes_by_key() {
        let (pools, net) = registry(resolver_for(&["a:1", "b:1"]));

        let host = pools
            .send_request("a:1", |client| {
                Box::pin(async move { client.host_name().to_string() })
            })
            .await
            .unwrap();
        assert_eq!(host, "a:1");
        pools.send_request("b:1", |_| Box::pin(async {})).await.unwrap();

        assert_eq!(net.connects(), 2);
        assert_eq!(pools.get("a:1").free_client_count(), 1);
        assert_eq!(pools.get("b:1").free_client_count(), 1);
    }

    #[tokio::test]
    async fn remove_shuts_pool_down() {
        let (pools, net) = registry(resolver_for(&["a:1"]));
        pools.send_request("a:1", |_| Box::pin(async {})).await.unwrap();
        let old = pools.get("a:1");

        assert!(pools.remove("a:1"));
        assert!(!pools.remove("a:1"));
        assert!(old.is_closed());
        assert_eq!(net.closes(), 1);

        let fresh = pools.get("a:1");
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert!(!fresh.is_closed());
    }

    #[tokio::test]
    async fn keys_lists_every_pool() {
        let (pools, _) = registry(resolver_for(&[]));
        for i in 0..10 {
            pools.get(&format!("host-{i}:80"));
        }
        let keys: HashSet<String> = pools.keys().into_iter().collect();
        assert_eq!(keys.len(), 10);
        assert!(keys.contains("host-7:80"));
    }

    #[tokio::test]
    async fn shutdown_clears_registry() {
        let (pools, _) = registry(resolver_for(&[]));
        let a = pools.get("a:1");
        pools.get("b:1");
        pools.shutdown();
        assert!(pools.is_empty());
        assert!(a.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn concurrent_first_access_yields_one_pool_per_key() {
        let (pools, _) = registry(resolver_for(&[]));
        let pools = Arc::new(pools);

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let pools = Arc::clone(&pools);
                tokio::spawn(async move {
                    (0..200)
                        .map(|i| pools.get(&format!("host-{i}")))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(pools.len(), 200);
        for seen in &results[1..] {
            for (i, pool) in seen.iter().enumerate() {
                assert!(Arc::ptr_eq(pool, &results[0][i]));
                assert_eq!(pool.host_name(), format!("host-{i}"));
            }
        }
    }
}
