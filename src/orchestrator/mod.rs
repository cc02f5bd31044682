//! Orchestrator: registry, router and failure isolation.
//!
//! # Data Flow
//! ```text
//! route_request(request)
//!     → LoadBalancer::select_server (healthy, matching type)
//!     → CircuitBreaker::is_open → CircuitOpen without contacting the backend
//!     → ServerInstance::handle_request
//!     → success: breaker.record_success, error counter reset
//!     → failure: breaker.record_failure, error counter += 1
//!         > error_threshold → unhealthy, excluded, recovery scheduled
//!
//! HealthEvent stream
//!     Unhealthy(id) → excluded, recovery scheduled
//!     Recovered(id) → selectable again
//! ```
//!
//! # Design Decisions
//! - Health drives selection; the breaker drives admission. Both must clear
//!   for a backend to fully recover.
//! - The breaker is mutated only here, after each call
//! - Recovery runs as one task per instance; a second schedule is a no-op

mod recovery;

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::validation::validate_server;
use crate::config::{CircuitBreakerConfig, OrchestratorSettings, ServerConfig};
use crate::error::{OrchestratorError, Result};
use crate::health::{HealthEvent, HealthMonitor};
use crate::instance::{InstanceContext, InstanceReport, ServerInstance};
use crate::load_balancer::{LoadBalancer, RouteContext};
use crate::observability::metrics;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::resilience::{CircuitBreaker, CircuitSnapshot};

use self::recovery::{recover, RecoverySchedule};

/// A registered instance with its breaker and recovery task.
pub(crate) struct ManagedServer {
    pub(crate) instance: Arc<ServerInstance>,
    pub(crate) breaker: CircuitBreaker,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl ManagedServer {
    fn cancel_recovery(&self) {
        if let Some(task) = self.recovery.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }
}

/// Instance status plus breaker state.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetrics {
    #[serde(flatten)]
    pub instance: InstanceReport,
    pub circuit: CircuitSnapshot,
}

pub struct Orchestrator {
    settings: OrchestratorSettings,
    breaker_config: CircuitBreakerConfig,
    context: InstanceContext,
    servers: DashMap<String, Arc<ManagedServer>>,
    load_balancer: Arc<dyn LoadBalancer>,
    health: Arc<dyn HealthMonitor>,
    shutdown: broadcast::Sender<()>,
}

impl Orchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        breaker_config: CircuitBreakerConfig,
        context: InstanceContext,
        load_balancer: Arc<dyn LoadBalancer>,
        health: Arc<dyn HealthMonitor>,
    ) -> Arc<Self> {
        let (shutdown, _) = broadcast::channel(1);
        Arc::new(Self {
            settings,
            breaker_config,
            context,
            servers: DashMap::new(),
            load_balancer,
            health,
            shutdown,
        })
    }

    pub fn context(&self) -> &InstanceContext {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.servers.contains_key(id)
    }

    /// Build, start and register a backend. Nothing stays registered on failure.
    pub async fn register_server(&self, config: ServerConfig) -> Result<Arc<ServerInstance>> {
        validate_server(&config)?;
        if self.servers.contains_key(&config.id) {
            return Err(OrchestratorError::Configuration(format!(
                "server '{}' is already registered",
                config.id
            )));
        }

        let mut context = self.context.clone();
        context.default_timeout = self.settings.request_timeout();
        let instance = ServerInstance::new(config, &context);
        instance.initialize().await?;

        let id = instance.id().to_string();
        let managed = Arc::new(ManagedServer {
            breaker: CircuitBreaker::new(id.as_str(), &self.breaker_config),
            instance: Arc::clone(&instance),
            recovery: Mutex::new(None),
        });

        let inserted = match self.servers.entry(id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(managed);
                true
            }
        };
        if !inserted {
            if let Err(e) = instance.shutdown().await {
                tracing::warn!(server = %id, error = %e, "Failed to stop duplicate instance");
            }
            return Err(OrchestratorError::Configuration(format!(
                "server '{}' is already registered",
                id
            )));
        }

        self.load_balancer.add_server(Arc::clone(&instance));
        self.health.monitor(Arc::clone(&instance));
        metrics::record_server_health(&id, true);
        tracing::info!(
            server = %id,
            server_type = %instance.server_type(),
            deployment = %instance.config().deployment_type(),
            "Server registered"
        );
        Ok(instance)
    }

    /// Stop and forget a backend.
    pub async fn unregister_server(&self, id: &str) -> Result<()> {
        let (_, managed) = self
            .servers
            .remove(id)
            .ok_or_else(|| OrchestratorError::NotFound(format!("server '{}'", id)))?;

        managed.cancel_recovery();
        self.health.unmonitor(id);
        self.load_balancer.remove_server(id);
        managed.instance.shutdown().await?;
        tracing::info!(server = %id, "Server unregistered");
        Ok(())
    }

    /// Route to any healthy backend.
    pub async fn route_request(&self, request: RpcRequest) -> Result<RpcResponse> {
        self.route(None, request).await
    }

    /// Route to a healthy backend of `server_type`.
    pub async fn route_request_to(&self, server_type: &str, request: RpcRequest) -> Result<RpcResponse> {
        self.route(Some(server_type), request).await
    }

    async fn route(&self, server_type: Option<&str>, request: RpcRequest) -> Result<RpcResponse> {
        request.validate()?;
        let server = self.select(server_type, &request.method)?;
        let instance = Arc::clone(&server.instance);
        self.guarded(&server, instance.handle_request(request)).await
    }

    /// Send a group as one batched call to one selected backend.
    pub async fn route_batch(&self, server_type: &str, requests: Vec<RpcRequest>) -> Result<Vec<RpcResponse>> {
        let Some(first) = requests.first() else {
            return Ok(Vec::new());
        };
        for request in &requests {
            request.validate()?;
        }
        let server = self.select(Some(server_type), &first.method)?;
        let instance = Arc::clone(&server.instance);
        self.guarded(&server, instance.handle_batch(requests)).await
    }

    fn select(&self, server_type: Option<&str>, method: &str) -> Result<Arc<ManagedServer>> {
        let ctx = RouteContext { server_type, method };
        let instance = self.load_balancer.select_server(&ctx).ok_or_else(|| match server_type {
            Some(t) => OrchestratorError::Server(format!("no healthy backends for type '{}'", t)),
            None => OrchestratorError::Server("no healthy backends".to_string()),
        })?;
        self.servers
            .get(instance.id())
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| OrchestratorError::Server("no healthy backends".to_string()))
    }

    /// Breaker admission, then the call, then the post-call bookkeeping.
    async fn guarded<T, F>(&self, server: &Arc<ManagedServer>, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let id = server.instance.id();
        if server.breaker.is_open() {
            metrics::record_circuit_rejection(id);
            return Err(OrchestratorError::CircuitOpen(id.to_string()));
        }

        let started = Instant::now();
        match call.await {
            Ok(value) => {
                server.breaker.record_success();
                server.instance.reset_errors();
                metrics::record_request(id, "success", started);
                Ok(value)
            }
            Err(e) => {
                server.breaker.record_failure();
                let errors = server.instance.record_error();
                metrics::record_request(id, e.kind(), started);
                tracing::warn!(server = %id, errors, error = %e, "Request failed");
                if errors > self.settings.error_threshold && server.instance.is_healthy() {
                    tracing::warn!(
                        server = %id,
                        errors,
                        threshold = self.settings.error_threshold,
                        "Error threshold exceeded, isolating server"
                    );
                    self.isolate(server);
                }
                Err(e)
            }
        }
    }

    fn isolate(&self, server: &Arc<ManagedServer>) {
        server.instance.set_healthy(false);
        self.load_balancer.mark_unhealthy(server.instance.id());
        self.schedule_recovery(server);
    }

    fn schedule_recovery(&self, server: &Arc<ManagedServer>) {
        let id = server.instance.id();
        if !server.instance.config().restart.auto_restart {
            tracing::info!(server = %id, "Automatic restart disabled, not scheduling recovery");
            return;
        }
        let mut slot = server.recovery.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let schedule = RecoverySchedule::new(&self.settings, &server.instance.config().restart);
        *slot = Some(tokio::spawn(recover(
            Arc::clone(server),
            Arc::clone(&self.load_balancer),
            schedule,
            self.shutdown.subscribe(),
        )));
    }

    /// Apply one health transition.
    pub fn handle_health_event(&self, event: &HealthEvent) {
        let Some(server) = self.servers.get(event.server_id()).map(|s| Arc::clone(s.value())) else {
            tracing::debug!(server = %event.server_id(), "Health event for unknown server");
            return;
        };
        match event {
            HealthEvent::Unhealthy(id) => {
                tracing::warn!(server = %id, "Server reported unhealthy");
                self.isolate(&server);
            }
            HealthEvent::Recovered(id) => {
                tracing::info!(server = %id, "Server reported recovered");
                server.cancel_recovery();
                server.instance.set_healthy(true);
                self.load_balancer.mark_healthy(id);
            }
        }
    }

    /// Consume health events until the channel or the orchestrator goes away.
    pub fn watch_health(self: &Arc<Self>, mut events: mpsc::UnboundedReceiver<HealthEvent>) -> JoinHandle<()> {
        let this: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        let (Some(event), Some(orchestrator)) = (event, this.upgrade()) else {
                            break;
                        };
                        orchestrator.handle_health_event(&event);
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Status of every registered instance, sorted by id.
    pub fn get_server_list(&self) -> Vec<InstanceReport> {
        let mut list: Vec<_> = self.servers.iter().map(|s| s.instance.get_status()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Metrics for one server, or all of them.
    pub fn get_server_metrics(&self, id: Option<&str>) -> Result<Vec<ServerMetrics>> {
        let collect = |s: &ManagedServer| ServerMetrics {
            instance: s.instance.get_status(),
            circuit: s.breaker.snapshot(),
        };
        match id {
            Some(id) => self
                .servers
                .get(id)
                .map(|s| vec![collect(s.value())])
                .ok_or_else(|| OrchestratorError::NotFound(format!("server '{}'", id))),
            None => {
                let mut all: Vec<_> = self.servers.iter().map(|s| collect(s.value())).collect();
                all.sort_by(|a, b| a.instance.id.cmp(&b.instance.id));
                Ok(all)
            }
        }
    }

    /// Stop every instance and background task.
    pub async fn shutdown(&self) {
        tracing::info!(servers = self.servers.len(), "Orchestrator shutting down");
        let _ = self.shutdown.send(());

        let ids: Vec<String> = self.servers.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.unregister_server(&id).await {
                tracing::warn!(server = %id, error = %e, "Failed to stop server during shutdown");
            }
        }
        self.context.pools.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Deployment, LoadBalancingStrategy};
    use crate::instance::tests::{context, echo_config};
    use crate::instance::InstanceStatus;
    use crate::load_balancer;
    use crate::resilience::CircuitState;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingMonitor {
        monitored: DashMap<String, ()>,
    }

    impl HealthMonitor for RecordingMonitor {
        fn monitor(&self, instance: Arc<ServerInstance>) {
            self.monitored.insert(instance.id().to_string(), ());
        }

        fn unmonitor(&self, id: &str) {
            self.monitored.remove(id);
        }
    }

    fn orchestrator(settings: OrchestratorSettings, breaker: CircuitBreakerConfig) -> (Arc<Orchestrator>, Arc<RecordingMonitor>) {
        let monitor = Arc::new(RecordingMonitor::default());
        let orchestrator = Orchestrator::new(
            settings,
            breaker,
            context(),
            load_balancer::from_strategy(LoadBalancingStrategy::RoundRobin),
            Arc::clone(&monitor) as Arc<dyn HealthMonitor>,
        );
        (orchestrator, monitor)
    }

    /// A backend that never answers.
    fn silent_config(id: &str, auto_restart: bool) -> ServerConfig {
        let mut config = ServerConfig::subprocess(id, "sleep", vec!["30".into()]);
        if let Deployment::Subprocess(spec) = &mut config.deployment {
            spec.settle_ms = 50;
            spec.shutdown_grace_secs = 1;
        }
        config.request_timeout_ms = Some(50);
        config.restart.auto_restart = auto_restart;
        config.restart.max_restarts = 2;
        config
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn register_route_unregister() {
        let (orch, monitor) = orchestrator(OrchestratorSettings::default(), CircuitBreakerConfig::default());
        orch.register_server(echo_config("echo")).await.unwrap();
        assert!(monitor.monitored.contains_key("echo"));

        let list = orch.get_server_list();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].status, InstanceStatus::Running);

        let response = orch
            .route_request(RpcRequest::new("tools/list", None).with_id(3))
            .await
            .unwrap();
        assert_eq!(response.id, Some(json!(3)));

        let metrics = orch.get_server_metrics(Some("echo")).unwrap();
        assert_eq!(metrics[0].instance.requests, 1);
        assert_eq!(metrics[0].circuit.state, CircuitState::Closed);

        orch.unregister_server("echo").await.unwrap();
        assert!(!monitor.monitored.contains_key("echo"));
        assert!(matches!(
            orch.unregister_server("echo").await,
            Err(OrchestratorError::NotFound(_))
        ));
        assert!(matches!(
            orch.get_server_metrics(Some("echo")),
            Err(OrchestratorError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn failed_start_leaves_nothing_registered() {
        let (orch, monitor) = orchestrator(OrchestratorSettings::default(), CircuitBreakerConfig::default());
        let config = ServerConfig::subprocess("ghost", "/definitely/not/a/binary", vec![]);
        let err = orch.register_server(config).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Server(_)));
        assert!(orch.is_empty());
        assert!(monitor.monitored.is_empty());

        let err = orch.route_request(RpcRequest::new("x", None)).await.unwrap_err();
        assert_eq!(err, OrchestratorError::Server("no healthy backends".into()));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected_before_start() {
        let (orch, _) = orchestrator(OrchestratorSettings::default(), CircuitBreakerConfig::default());
        let config = ServerConfig::subprocess("", "cat", vec![]);
        assert!(matches!(
            orch.register_server(config).await,
            Err(OrchestratorError::Configuration(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn open_breaker_rejects_without_calling_backend() {
        let settings = OrchestratorSettings {
            error_threshold: 100,
            ..OrchestratorSettings::default()
        };
        let breaker = CircuitBreakerConfig {
            failure_threshold: 2,
            ..CircuitBreakerConfig::default()
        };
        let (orch, _) = orchestrator(settings, breaker);
        orch.register_server(silent_config("slow", false)).await.unwrap();

        for _ in 0..2 {
            let err = orch.route_request(RpcRequest::new("tools/call", None)).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Timeout(_)));
        }
        let err = orch.route_request(RpcRequest::new("tools/call", None)).await.unwrap_err();
        assert_eq!(err, OrchestratorError::CircuitOpen("slow".into()));
        // the rejected call never reached the instance
        assert_eq!(orch.get_server_list()[0].requests, 2);

        orch.shutdown().await;
        assert!(orch.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn error_threshold_isolates_server() {
        let (orch, _) = orchestrator(OrchestratorSettings::default(), CircuitBreakerConfig::default());
        orch.register_server(silent_config("slow", false)).await.unwrap();

        for _ in 0..4 {
            let err = orch.route_request(RpcRequest::new("tools/call", None)).await.unwrap_err();
            assert!(matches!(err, OrchestratorError::Timeout(_)));
        }
        let report = &orch.get_server_list()[0];
        assert!(!report.healthy);
        assert_eq!(report.status, InstanceStatus::Unhealthy);

        let err = orch.route_request(RpcRequest::new("tools/call", None)).await.unwrap_err();
        assert_eq!(err, OrchestratorError::Server("no healthy backends".into()));
        orch.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn recovery_restarts_and_readmits() {
        let settings = OrchestratorSettings {
            error_threshold: 0,
            recovery_delay_secs: 0,
            recovery_retry_delay_secs: 0,
            ..OrchestratorSettings::default()
        };
        let (orch, _) = orchestrator(settings, CircuitBreakerConfig::default());
        let instance = orch.register_server(silent_config("slow", true)).await.unwrap();

        let _ = orch.route_request(RpcRequest::new("tools/call", None)).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(instance.restart_count() == 1 && instance.is_healthy()) {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        let metrics = orch.get_server_metrics(Some("slow")).unwrap();
        assert_eq!(metrics[0].instance.error_count, 0);
        assert_eq!(metrics[0].circuit.failure_count, 0);
        // selectable again: the call reaches the backend and times out
        let err = orch.route_request(RpcRequest::new("tools/call", None)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));
        orch.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn batch_routes_by_type() {
        let (orch, _) = orchestrator(OrchestratorSettings::default(), CircuitBreakerConfig::default());
        let mut config = echo_config("files-1");
        config.server_type = "files".into();
        orch.register_server(config).await.unwrap();

        let responses = orch
            .route_batch(
                "files",
                vec![
                    RpcRequest::new("read", Some(json!({"path": "a"}))).with_id(1),
                    RpcRequest::new("read", Some(json!({"path": "b"}))).with_id(2),
                ],
            )
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0].id, Some(json!(1)));
        assert_eq!(responses[1].id, Some(json!(2)));

        let err = orch
            .route_batch("search", vec![RpcRequest::new("q", None)])
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Server(_)));
        assert!(orch.route_batch("files", Vec::new()).await.unwrap().is_empty());
        orch.shutdown().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn health_events_toggle_selection() {
        let (orch, _) = orchestrator(OrchestratorSettings::default(), CircuitBreakerConfig::default());
        let mut config = echo_config("echo");
        config.restart.auto_restart = false;
        orch.register_server(config).await.unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = orch.watch_health(rx);

        tx.send(HealthEvent::Unhealthy("echo".into())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while orch.get_server_list()[0].healthy {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(orch.route_request(RpcRequest::new("ping", None)).await.is_err());

        tx.send(HealthEvent::Recovered("echo".into())).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while !orch.get_server_list()[0].healthy {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(orch.route_request(RpcRequest::new("ping", None)).await.is_ok());

        orch.shutdown().await;
        tokio::time::timeout(Duration::from_secs(1), watcher).await.unwrap().unwrap();
    }
}
