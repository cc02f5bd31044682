//! Server instances: one backend under uniform lifecycle control.
//!
//! # Data Flow
//! ```text
//! ServerConfig → ServerInstance::new (driver chosen once from the deployment)
//!     initialize → driver.start → Running
//!     handle_request → driver.call (stats: count, errors, moving-average latency)
//!     health_check → driver.probe
//!     restart → driver.stop + driver.start
//!     shutdown → driver.stop → Stopped
//! ```
//!
//! # Design Decisions
//! - Closed set of drivers (`DeploymentKind`) dispatched by `match`
//! - Drivers report unexpected exits through `Liveness`, which flips the
//!   healthy flag and broadcasts an `InstanceEvent`

pub mod container;
pub mod http;
pub mod socket;
pub mod subprocess;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::config::{Deployment, DeploymentType, ServerConfig};
use crate::error::{OrchestratorError, Result};
use crate::observability::metrics;
use crate::pool::ConnectionPoolManager;
use crate::protocol::{RpcRequest, RpcResponse};

pub use container::ContainerDriver;
pub use socket::SocketDriver;
pub use subprocess::SubprocessDriver;

/// Weight of the newest sample in the response-time moving average.
const LATENCY_SMOOTHING: f64 = 0.2;

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Starting,
    Running,
    Unhealthy,
    Stopped,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceStatus::Starting => "starting",
            InstanceStatus::Running => "running",
            InstanceStatus::Unhealthy => "unhealthy",
            InstanceStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Events an instance publishes to its subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum InstanceEvent {
    /// The backend process exited or its connection closed.
    Exited {
        id: String,
        code: Option<i32>,
        expected: bool,
    },
}

/// Shared handle drivers use to report that their backend went away.
#[derive(Debug, Clone)]
pub struct Liveness {
    id: String,
    healthy: Arc<AtomicBool>,
    events: broadcast::Sender<InstanceEvent>,
}

impl Liveness {
    fn new(id: &str) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            id: id.to_string(),
            healthy: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    pub fn exited(&self, code: Option<i32>, expected: bool) {
        self.healthy.store(false, Ordering::SeqCst);
        if expected {
            tracing::debug!(server = %self.id, ?code, "Backend stopped");
        } else {
            tracing::warn!(server = %self.id, ?code, "Backend exited unexpectedly");
            metrics::record_server_health(&self.id, false);
        }
        let _ = self.events.send(InstanceEvent::Exited {
            id: self.id.clone(),
            code,
            expected,
        });
    }
}

/// Collaborators every driver may need.
#[derive(Clone)]
pub struct InstanceContext {
    pub pools: Arc<ConnectionPoolManager>,
    pub log_dir: Option<PathBuf>,
    pub default_timeout: Duration,
}

impl InstanceContext {
    pub fn new(pools: Arc<ConnectionPoolManager>) -> Self {
        Self {
            pools,
            log_dir: None,
            default_timeout: Duration::from_secs(30),
        }
    }
}

/// The deployment-specific half of an instance.
pub enum DeploymentKind {
    Container(ContainerDriver),
    Subprocess(SubprocessDriver),
    Socket(SocketDriver),
}

impl DeploymentKind {
    fn build(config: &ServerConfig, ctx: &InstanceContext, liveness: Liveness) -> Self {
        match &config.deployment {
            Deployment::Container(spec) => DeploymentKind::Container(ContainerDriver::new(config, spec.clone(), ctx)),
            Deployment::Subprocess(spec) => {
                DeploymentKind::Subprocess(SubprocessDriver::new(config, spec.clone(), ctx, liveness))
            }
            Deployment::Socket(spec) => DeploymentKind::Socket(SocketDriver::new(&config.id, spec.clone(), liveness)),
        }
    }

    async fn start(&self) -> Result<()> {
        match self {
            DeploymentKind::Container(d) => d.start().await,
            DeploymentKind::Subprocess(d) => d.start().await,
            DeploymentKind::Socket(d) => d.start().await,
        }
    }

    async fn call(&self, request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        match self {
            DeploymentKind::Container(d) => d.call(request, timeout).await,
            DeploymentKind::Subprocess(d) => d.call(request, timeout).await,
            DeploymentKind::Socket(d) => d.call(request, timeout).await,
        }
    }

    async fn call_batch(&self, requests: Vec<RpcRequest>, timeout: Duration) -> Result<Vec<RpcResponse>> {
        match self {
            DeploymentKind::Container(d) => d.call_batch(requests, timeout).await,
            DeploymentKind::Subprocess(d) => d.call_batch(requests, timeout).await,
            DeploymentKind::Socket(d) => d.call_batch(requests, timeout).await,
        }
    }

    async fn probe(&self, timeout: Duration) -> bool {
        match self {
            DeploymentKind::Container(d) => d.probe(timeout).await,
            DeploymentKind::Subprocess(d) => d.probe(timeout).await,
            DeploymentKind::Socket(d) => d.probe(timeout).await,
        }
    }

    async fn stop(&self) -> Result<()> {
        match self {
            DeploymentKind::Container(d) => d.stop().await,
            DeploymentKind::Subprocess(d) => d.stop().await,
            DeploymentKind::Socket(d) => d.stop().await,
        }
    }

    fn pid(&self) -> Option<u32> {
        match self {
            DeploymentKind::Subprocess(d) => d.pid(),
            _ => None,
        }
    }
}

/// Rolling request statistics.
#[derive(Debug, Default)]
struct RequestStats {
    requests: AtomicU64,
    errors: AtomicU64,
    in_flight: AtomicUsize,
    avg_response_ms: Mutex<f64>,
}

impl RequestStats {
    fn record(&self, elapsed: Duration, ok: bool) {
        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        if !ok {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
        let sample = elapsed.as_secs_f64() * 1000.0;
        let mut avg = self.avg_response_ms.lock().unwrap_or_else(PoisonError::into_inner);
        *avg = if n == 1 {
            sample
        } else {
            *avg + LATENCY_SMOOTHING * (sample - *avg)
        };
    }
}

/// Counts a request as in flight until dropped.
#[derive(Debug)]
pub struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
    weight: usize,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(self.weight, Ordering::Relaxed);
    }
}

/// Snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub id: String,
    pub server_type: String,
    pub deployment: DeploymentType,
    pub status: InstanceStatus,
    pub healthy: bool,
    pub error_count: u32,
    pub restart_count: u32,
    pub uptime_secs: Option<u64>,
    pub pid: Option<u32>,
    pub requests: u64,
    pub errors: u64,
    pub in_flight: usize,
    pub avg_response_ms: f64,
}

/// One backend under orchestration.
pub struct ServerInstance {
    config: ServerConfig,
    kind: DeploymentKind,
    liveness: Liveness,
    status: Mutex<InstanceStatus>,
    error_count: AtomicU32,
    restart_count: AtomicU32,
    started_at: Mutex<Option<Instant>>,
    stats: RequestStats,
    default_timeout: Duration,
}

impl ServerInstance {
    pub fn new(config: ServerConfig, ctx: &InstanceContext) -> Arc<Self> {
        let liveness = Liveness::new(&config.id);
        let kind = DeploymentKind::build(&config, ctx, liveness.clone());
        Arc::new(Self {
            config,
            kind,
            liveness,
            status: Mutex::new(InstanceStatus::Stopped),
            error_count: AtomicU32::new(0),
            restart_count: AtomicU32::new(0),
            started_at: Mutex::new(None),
            stats: RequestStats::default(),
            default_timeout: ctx.default_timeout,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn server_type(&self) -> &str {
        &self.config.server_type
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn lock_status(&self) -> MutexGuard<'_, InstanceStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: InstanceStatus) {
        *self.lock_status() = status;
    }

    /// Lifecycle status. A running instance whose backend went away reports unhealthy.
    pub fn status(&self) -> InstanceStatus {
        let status = *self.lock_status();
        if status == InstanceStatus::Running && !self.is_healthy() {
            InstanceStatus::Unhealthy
        } else {
            status
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.liveness.healthy.load(Ordering::SeqCst)
    }

    /// Flip selection eligibility. Stopped instances stay stopped.
    pub fn set_healthy(&self, healthy: bool) {
        self.liveness.healthy.store(healthy, Ordering::SeqCst);
        let mut status = self.lock_status();
        if *status != InstanceStatus::Stopped && *status != InstanceStatus::Starting {
            *status = if healthy {
                InstanceStatus::Running
            } else {
                InstanceStatus::Unhealthy
            };
        }
        drop(status);
        metrics::record_server_health(self.id(), healthy);
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Count an orchestrator-observed failure; returns the new count.
    pub fn record_error(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset_errors(&self) {
        self.error_count.store(0, Ordering::SeqCst);
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::Relaxed)
    }

    /// Mark `weight` requests as in flight for the guard's lifetime.
    pub fn track_in_flight(&self, weight: usize) -> InFlightGuard<'_> {
        self.stats.in_flight.fetch_add(weight, Ordering::Relaxed);
        InFlightGuard {
            counter: &self.stats.in_flight,
            weight,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.kind.pid()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.liveness.events.subscribe()
    }

    fn request_timeout(&self) -> Duration {
        self.config
            .request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout)
    }

    fn probe_timeout(&self) -> Duration {
        let secs = self.config.health_check.as_ref().map(|h| h.timeout_secs).unwrap_or(5);
        Duration::from_secs(secs.max(1))
    }

    /// Start the backend and wait until it is ready.
    pub async fn initialize(&self) -> Result<()> {
        self.set_status(InstanceStatus::Starting);
        tracing::info!(
            server = %self.id(),
            deployment = %self.config.deployment_type(),
            "Starting server instance"
        );
        match self.kind.start().await {
            Ok(()) => {
                *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
                self.set_status(InstanceStatus::Running);
                self.set_healthy(true);
                tracing::info!(server = %self.id(), pid = ?self.pid(), "Server instance running");
                Ok(())
            }
            Err(e) => {
                self.set_status(InstanceStatus::Stopped);
                self.liveness.healthy.store(false, Ordering::SeqCst);
                tracing::error!(server = %self.id(), error = %e, "Server instance failed to start");
                Err(match e {
                    OrchestratorError::Server(_) => e,
                    other => OrchestratorError::Server(format!("{} failed to start: {}", self.id(), other)),
                })
            }
        }
    }

    /// Execute one request against the backend.
    pub async fn handle_request(&self, request: RpcRequest) -> Result<RpcResponse> {
        request.validate()?;
        if self.status() == InstanceStatus::Stopped {
            return Err(OrchestratorError::Server(format!("server {} is stopped", self.id())));
        }

        let timeout = self.request_timeout();
        let started = Instant::now();
        let guard = self.track_in_flight(1);
        let result = match tokio::time::timeout(timeout, self.kind.call(request, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "request to {} after {:?}",
                self.id(),
                timeout
            ))),
        };
        drop(guard);
        self.stats.record(started.elapsed(), result.is_ok());
        result
    }

    /// Execute a group of requests as one backend call. Responses keep the
    /// backend's order.
    pub async fn handle_batch(&self, requests: Vec<RpcRequest>) -> Result<Vec<RpcResponse>> {
        for request in &requests {
            request.validate()?;
        }
        if self.status() == InstanceStatus::Stopped {
            return Err(OrchestratorError::Server(format!("server {} is stopped", self.id())));
        }

        let count = requests.len();
        let timeout = self.request_timeout();
        let started = Instant::now();
        let guard = self.track_in_flight(count);
        let result = match tokio::time::timeout(timeout, self.kind.call_batch(requests, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::Timeout(format!(
                "batch of {} to {} after {:?}",
                count,
                self.id(),
                timeout
            ))),
        };
        drop(guard);
        self.stats.record(started.elapsed(), result.is_ok());
        result
    }

    /// Probe the backend. A failed probe clears the healthy flag.
    pub async fn health_check(&self) -> bool {
        if self.status() == InstanceStatus::Stopped {
            return false;
        }
        let alive = self.kind.probe(self.probe_timeout()).await;
        if !alive {
            self.set_healthy(false);
        }
        alive
    }

    /// Stop and start the backend again.
    pub async fn restart(&self) -> Result<()> {
        let attempt = self.restart_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(server = %self.id(), attempt, "Restarting server instance");
        if let Err(e) = self.kind.stop().await {
            tracing::warn!(server = %self.id(), error = %e, "Stop before restart failed");
        }
        if let Err(e) = self.initialize().await {
            // Still registered and awaiting recovery, so not a clean stop.
            self.set_status(InstanceStatus::Unhealthy);
            return Err(e);
        }
        self.reset_errors();
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(server = %self.id(), "Shutting down server instance");
        self.set_status(InstanceStatus::Stopped);
        self.liveness.healthy.store(false, Ordering::SeqCst);
        *self.started_at.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.kind.stop().await
    }

    pub fn get_status(&self) -> InstanceReport {
        let uptime_secs = self
            .started_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .map(|at| at.elapsed().as_secs());
        InstanceReport {
            id: self.config.id.clone(),
            server_type: self.config.server_type.clone(),
            deployment: self.config.deployment_type(),
            status: self.status(),
            healthy: self.is_healthy(),
            error_count: self.error_count(),
            restart_count: self.restart_count(),
            uptime_secs,
            pid: self.pid(),
            requests: self.stats.requests.load(Ordering::Relaxed),
            errors: self.stats.errors.load(Ordering::Relaxed),
            in_flight: self.in_flight(),
            avg_response_ms: *self.stats.avg_response_ms.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

impl std::fmt::Debug for ServerInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInstance")
            .field("id", &self.config.id)
            .field("server_type", &self.config.server_type)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::pool::TransportConnector;
    use serde_json::json;

    pub(crate) fn context() -> InstanceContext {
        let pools = Arc::new(ConnectionPoolManager::new(
            TransportConnector::default(),
            PoolConfig::default(),
        ));
        InstanceContext {
            pools,
            log_dir: None,
            default_timeout: Duration::from_secs(5),
        }
    }

    pub(crate) fn echo_config(id: &str) -> ServerConfig {
        let mut config = ServerConfig::subprocess(id, "cat", vec![]);
        if let Deployment::Subprocess(spec) = &mut config.deployment {
            spec.settle_ms = 50;
            spec.shutdown_grace_secs = 1;
        }
        config
    }

    #[test]
    fn moving_average_tracks_latency() {
        let stats = RequestStats::default();
        stats.record(Duration::from_millis(100), true);
        assert_eq!(*stats.avg_response_ms.lock().unwrap(), 100.0);
        stats.record(Duration::from_millis(200), false);
        let avg = *stats.avg_response_ms.lock().unwrap();
        assert!((avg - 120.0).abs() < 1e-6);
        assert_eq!(stats.errors.load(Ordering::Relaxed), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lifecycle_and_stats() {
        let instance = ServerInstance::new(echo_config("echo"), &context());
        assert_eq!(instance.status(), InstanceStatus::Stopped);

        instance.initialize().await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Running);
        assert!(instance.is_healthy());

        let response = instance
            .handle_request(RpcRequest::new("tools/list", Some(json!({}))).with_id(7))
            .await
            .unwrap();
        assert_eq!(response.id, Some(json!(7)));

        let report = instance.get_status();
        assert_eq!(report.requests, 1);
        assert_eq!(report.errors, 0);
        assert!(report.pid.is_some());

        instance.shutdown().await.unwrap();
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert!(!instance.health_check().await);
    }

    #[tokio::test]
    async fn failed_start_is_server_error() {
        let config = ServerConfig::subprocess("ghost", "/definitely/not/a/binary", vec![]);
        let instance = ServerInstance::new(config, &context());
        let err = instance.initialize().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Server(_)));
        assert_eq!(instance.status(), InstanceStatus::Stopped);
        assert!(!instance.is_healthy());
    }

    #[tokio::test]
    async fn failed_restart_leaves_instance_unhealthy() {
        let config = ServerConfig::subprocess("ghost", "/definitely/not/a/binary", vec![]);
        let instance = ServerInstance::new(config, &context());
        assert!(instance.restart().await.is_err());
        assert_eq!(instance.restart_count(), 1);
        assert_eq!(instance.status(), InstanceStatus::Unhealthy);
        assert!(!instance.is_healthy());
        assert_eq!(instance.get_status().status, InstanceStatus::Unhealthy);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn invalid_request_rejected_before_backend() {
        let instance = ServerInstance::new(echo_config("echo-v"), &context());
        instance.initialize().await.unwrap();
        let err = instance.handle_request(RpcRequest::new("", None)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(instance.get_status().requests, 0);
        instance.shutdown().await.unwrap();
    }
}
