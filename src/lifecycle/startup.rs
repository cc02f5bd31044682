//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Initialize all subsystems in dependency order
//! - Register configured servers
//! - Start background tasks (health events, cache sweeps)
//! - Reconcile the registry against reloaded configuration

use std::path::PathBuf;
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::batching::{BatchingEngine, OrchestratorExecutor, ResponseCache};
use crate::config::validation::{join, validate_config};
use crate::config::watcher::diff_servers;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::health::IntervalHealthMonitor;
use crate::instance::InstanceContext;
use crate::lifecycle::Shutdown;
use crate::load_balancer;
use crate::orchestrator::Orchestrator;
use crate::pool::{ConnectionPoolManager, TransportConnector};
use crate::resilience::RetryPolicy;

/// Every long-lived component of a running orchestrator.
pub struct Runtime {
    config: OrchestratorConfig,
    pub orchestrator: Arc<Orchestrator>,
    pub health: Arc<IntervalHealthMonitor>,
    pub engine: Arc<BatchingEngine<OrchestratorExecutor>>,
    pub shutdown: Shutdown,
    tasks: Vec<JoinHandle<()>>,
}

impl Runtime {
    /// Build the core from `config` and register its servers.
    pub async fn start(config: OrchestratorConfig) -> Result<Self> {
        validate_config(&config).map_err(|errors| OrchestratorError::Configuration(join(&errors)))?;

        let shutdown = Shutdown::new();
        let pools = Arc::new(ConnectionPoolManager::new(
            TransportConnector::default(),
            config.pool.clone(),
        ));
        let mut context = InstanceContext::new(pools);
        context.log_dir = config.log_dir.as_ref().map(PathBuf::from);
        context.default_timeout = config.orchestrator.request_timeout();

        let balancer = load_balancer::from_strategy(config.load_balancing);
        let (health, health_events) = IntervalHealthMonitor::new(config.health_check.clone());
        let health = Arc::new(health);

        let orchestrator = Orchestrator::new(
            config.orchestrator.clone(),
            config.circuit_breaker.clone(),
            context,
            balancer,
            Arc::clone(&health) as Arc<dyn crate::health::HealthMonitor>,
        );
        let mut tasks = vec![orchestrator.watch_health(health_events)];

        let cache = Arc::new(ResponseCache::new(config.cache.clone()));
        let engine = BatchingEngine::new(
            config.batching.clone(),
            cache,
            RetryPolicy::new(config.retries.clone()),
            OrchestratorExecutor::new(Arc::clone(&orchestrator)),
        );
        tasks.push(engine.start(shutdown.subscribe()));

        let runtime = Self {
            config: config.clone(),
            orchestrator,
            health,
            engine,
            shutdown,
            tasks,
        };
        let registered = runtime.register_all(&config).await;
        tracing::info!(
            configured = config.servers.len(),
            registered,
            strategy = ?config.load_balancing,
            "Orchestrator started"
        );
        Ok(runtime)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    async fn register_all(&self, config: &OrchestratorConfig) -> usize {
        let mut registered = 0;
        for server in &config.servers {
            if !server.restart.auto_start {
                tracing::info!(server = %server.id, "Auto start disabled, not registering");
                continue;
            }
            match self.orchestrator.register_server(server.clone()).await {
                Ok(_) => registered += 1,
                Err(e) => tracing::error!(server = %server.id, error = %e, "Failed to register server"),
            }
        }
        registered
    }

    /// Move the registry to the servers of `next`. Other sections only apply on restart.
    pub async fn reconcile(&mut self, next: OrchestratorConfig) -> Result<()> {
        validate_config(&next).map_err(|errors| OrchestratorError::Configuration(join(&errors)))?;

        let current: Vec<_> = self
            .config
            .servers
            .iter()
            .filter(|s| self.orchestrator.contains(&s.id))
            .cloned()
            .collect();
        let diff = diff_servers(&current, &next.servers);
        tracing::info!(
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Reconciling servers"
        );

        for id in &diff.removed {
            if let Err(e) = self.orchestrator.unregister_server(id).await {
                tracing::warn!(server = %id, error = %e, "Failed to unregister server");
            }
        }
        for server in diff.added {
            if !server.restart.auto_start {
                tracing::info!(server = %server.id, "Auto start disabled, not registering");
                continue;
            }
            if let Err(e) = self.orchestrator.register_server(server.clone()).await {
                tracing::error!(server = %server.id, error = %e, "Failed to register server");
            }
        }
        self.config.servers = next.servers;
        Ok(())
    }

    /// Flush queued work, stop every instance and background task.
    pub async fn stop(self) {
        tracing::info!("Stopping orchestrator");
        self.engine.flush_all();
        self.shutdown.trigger();
        self.orchestrator.shutdown().await;
        self.health.stop_all();
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("Shutdown complete");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::batching::RequestOptions;
    use crate::config::{Deployment, ServerConfig};

    fn echo(id: &str) -> ServerConfig {
        let mut config = ServerConfig::subprocess(id, "cat", vec![]);
        if let Deployment::Subprocess(spec) = &mut config.deployment {
            spec.settle_ms = 50;
            spec.shutdown_grace_secs = 1;
        }
        config
    }

    fn config(servers: Vec<ServerConfig>) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::default();
        config.servers = servers;
        config.observability.metrics_enabled = false;
        config
    }

    #[tokio::test]
    async fn starts_routes_reconciles_and_stops() {
        let mut runtime = Runtime::start(config(vec![echo("a"), ServerConfig::subprocess("bad", "/no/such/bin", vec![])]))
            .await
            .unwrap();
        assert_eq!(runtime.orchestrator.len(), 1);
        assert_eq!(runtime.health.monitored(), 1);

        let value = runtime
            .engine
            .add_request("tools/list", None, "default", RequestOptions::default())
            .await
            .unwrap();
        assert!(value.is_null());

        runtime.reconcile(config(vec![echo("b")])).await.unwrap();
        let ids: Vec<_> = runtime.orchestrator.get_server_list().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["b".to_string()]);

        runtime.stop().await;
    }

    #[tokio::test]
    async fn servers_without_auto_start_are_not_registered() {
        let mut manual = echo("manual");
        manual.restart.auto_start = false;
        let mut runtime = Runtime::start(config(vec![echo("a"), manual.clone()])).await.unwrap();
        assert!(runtime.orchestrator.contains("a"));
        assert!(!runtime.orchestrator.contains("manual"));

        runtime.reconcile(config(vec![echo("a"), manual])).await.unwrap();
        assert_eq!(runtime.orchestrator.len(), 1);

        runtime.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_is_fatal() {
        let mut cfg = config(vec![echo("dup"), echo("dup")]);
        cfg.pool.min_connections = 20;
        let err = Runtime::start(cfg).await.err().unwrap();
        assert!(matches!(err, OrchestratorError::Configuration(_)));
    }
}
