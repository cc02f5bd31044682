//! Named pools shared across the orchestrator.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::config::validation::validate_pool;
use crate::config::PoolConfig;
use crate::error::{OrchestratorError, Result};
use crate::pool::connection::{ConnectionId, Endpoint, PooledConnection};
use crate::pool::factory::{ConnectionFactory, TransportConnector};
use crate::pool::pool::{AcquireOptions, Checkout, ConnectionPool, PoolStats};

/// Registry of pools keyed by name. One pool per (name, endpoint).
pub struct ConnectionPoolManager<F: ConnectionFactory = TransportConnector> {
    pools: DashMap<String, Arc<ConnectionPool<F>>>,
    factory: Arc<F>,
    defaults: PoolConfig,
    shutdown: broadcast::Sender<()>,
}

impl<F: ConnectionFactory> ConnectionPoolManager<F> {
    pub fn new(factory: F, defaults: PoolConfig) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            pools: DashMap::new(),
            factory: Arc::new(factory),
            defaults,
            shutdown,
        }
    }

    /// Create a pool, or return the existing one for the same name and endpoint.
    pub fn create_pool(
        &self,
        name: &str,
        endpoint: Endpoint,
        config: Option<PoolConfig>,
    ) -> Result<Arc<ConnectionPool<F>>> {
        let config = config.unwrap_or_else(|| self.defaults.clone());
        validate_pool(&config)?;

        match self.pools.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                if *existing.get().endpoint() != endpoint {
                    return Err(OrchestratorError::Configuration(format!(
                        "pool '{}' already exists for {}",
                        name,
                        existing.get().endpoint()
                    )));
                }
                Ok(Arc::clone(existing.get()))
            }
            Entry::Vacant(slot) => {
                tracing::info!(
                    pool = %name,
                    endpoint = %endpoint,
                    min = config.min_connections,
                    max = config.max_connections,
                    "Creating connection pool"
                );
                let pool = Arc::new(ConnectionPool::new(name, endpoint, config, Arc::clone(&self.factory)));
                pool.start_maintenance(self.shutdown.subscribe());
                slot.insert(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionPool<F>>> {
        self.pools.get(name).map(|p| Arc::clone(p.value()))
    }

    fn require(&self, name: &str) -> Result<Arc<ConnectionPool<F>>> {
        self.get(name)
            .ok_or_else(|| OrchestratorError::NotFound(format!("pool '{}'", name)))
    }

    pub async fn acquire_connection(
        &self,
        name: &str,
        options: AcquireOptions,
    ) -> Result<PooledConnection<F::Connection>> {
        self.require(name)?.acquire(options).await
    }

    /// Like `acquire_connection`, but the connection goes back to the pool
    /// when the returned guard is dropped.
    pub async fn checkout(&self, name: &str, options: AcquireOptions) -> Result<Checkout<F>> {
        self.require(name)?.checkout(options).await
    }

    pub fn release_connection(&self, name: &str, conn: PooledConnection<F::Connection>) -> Result<()> {
        self.require(name)?.release(conn);
        Ok(())
    }

    /// Evict the policy-selected idle connection of a pool.
    pub fn evict(&self, name: &str) -> Result<Option<ConnectionId>> {
        Ok(self.require(name)?.evict())
    }

    pub fn remove_pool(&self, name: &str) -> bool {
        match self.pools.remove(name) {
            Some((_, pool)) => {
                pool.close();
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<_> = self.pools.iter().map(|p| p.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Stop maintenance loops and close every pool.
    pub fn close_all(&self) {
        let _ = self.shutdown.send(());
        let names: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        for name in names {
            self.remove_pool(&name);
        }
    }
}
