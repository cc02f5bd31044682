//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the orchestrator.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the orchestrator.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Backend servers to register at startup.
    pub servers: Vec<ServerConfig>,

    /// Routing, error-threshold and recovery settings.
    pub orchestrator: OrchestratorSettings,

    /// Per-backend circuit breaker parameters.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Defaults for connection pools created for pooled transports.
    pub pool: PoolConfig,

    /// Request batching engine.
    pub batching: BatchingConfig,

    /// Response cache used by the batching engine.
    pub cache: CacheConfig,

    /// Retry configuration.
    pub retries: RetryConfig,

    /// Default health check settings (servers may override).
    pub health_check: HealthCheckConfig,

    /// Backend selection strategy.
    pub load_balancing: LoadBalancingStrategy,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API settings.
    pub admin: AdminConfig,

    /// Directory for subprocess stderr logs.
    pub log_dir: Option<String>,
}

/// A single backend definition. Immutable once an instance is built from it.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Unique server identifier.
    pub id: String,

    /// Logical backend type; routing and batching select by this.
    #[serde(default = "default_server_type")]
    pub server_type: String,

    /// How the backend is deployed.
    pub deployment: Deployment,

    /// Environment passed to the backend.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub resources: ResourceLimits,

    /// Overrides the global health check settings.
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub auto_scaling: AutoScalingPolicy,

    #[serde(default)]
    pub restart: RestartPolicy,

    /// Per-request deadline, falls back to the orchestrator default.
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,
}

fn default_server_type() -> String {
    "default".to_string()
}

impl ServerConfig {
    /// Build a subprocess-backed config with defaults everywhere else.
    pub fn subprocess(id: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_deployment(
            id,
            Deployment::Subprocess(SubprocessSpec {
                command: command.into(),
                args,
                working_dir: None,
                endpoint: None,
                settle_ms: default_settle_ms(),
                shutdown_grace_secs: default_shutdown_grace_secs(),
            }),
        )
    }

    pub fn with_deployment(id: impl Into<String>, deployment: Deployment) -> Self {
        Self {
            id: id.into(),
            server_type: default_server_type(),
            deployment,
            env: BTreeMap::new(),
            resources: ResourceLimits::default(),
            health_check: None,
            auto_scaling: AutoScalingPolicy::default(),
            restart: RestartPolicy::default(),
            request_timeout_ms: None,
        }
    }

    pub fn deployment_type(&self) -> DeploymentType {
        match self.deployment {
            Deployment::Container(_) => DeploymentType::Container,
            Deployment::Subprocess(_) => DeploymentType::Subprocess,
            Deployment::Socket(_) => DeploymentType::Socket,
        }
    }
}

/// Deployment strategy plus its parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Deployment {
    Container(ContainerSpec),
    Subprocess(SubprocessSpec),
    Socket(SocketSpec),
}

/// Deployment type without parameters, for status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentType {
    Container,
    Subprocess,
    Socket,
}

impl fmt::Display for DeploymentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeploymentType::Container => write!(f, "container"),
            DeploymentType::Subprocess => write!(f, "subprocess"),
            DeploymentType::Socket => write!(f, "socket"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ContainerSpec {
    /// Image to run.
    pub image: String,

    /// Port the server listens on inside the container; published on the same host port.
    #[serde(default = "default_container_port")]
    pub port: u16,

    /// HTTP path accepting JSON-RPC posts.
    #[serde(default = "default_rpc_path")]
    pub path: String,

    /// Container runtime binary.
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Extra arguments appended after the image.
    #[serde(default)]
    pub args: Vec<String>,

    /// Readiness polls (one per second) before giving up.
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,

    /// Seconds `stop` waits before the runtime kills the container.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_container_port() -> u16 {
    8080
}

fn default_rpc_path() -> String {
    "/mcp".to_string()
}

fn default_runtime() -> String {
    "docker".to_string()
}

fn default_start_attempts() -> u32 {
    30
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubprocessSpec {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub working_dir: Option<String>,

    /// HTTP endpoint exposed by the child. Without one, stdio is used.
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Settle delay before the child is considered ready.
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,

    /// Grace period between closing stdin and killing the child.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

fn default_settle_ms() -> u64 {
    1000
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SocketSpec {
    /// `ws://` or `wss://` URL of the long-lived connection.
    pub url: String,

    /// Per-call deadline for a correlated response.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

/// Resource limits applied at deployment time.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit such as "512m" or "2g".
    pub memory: Option<String>,

    /// CPU share such as 0.5.
    pub cpus: Option<f64>,
}

/// Auto-scaling policy. Reported and validated; scaling is driven elsewhere.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AutoScalingPolicy {
    pub enabled: bool,
    pub min_instances: u32,
    pub max_instances: u32,
    pub target_cpu_percent: u32,
}

impl Default for AutoScalingPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            min_instances: 1,
            max_instances: 1,
            target_cpu_percent: 70,
        }
    }
}

/// Automatic recovery policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartPolicy {
    /// Register and start the server when the configuration is loaded.
    /// When false it can still be added through the admin API.
    pub auto_start: bool,

    /// Schedule recovery attempts when the instance turns unhealthy.
    pub auto_restart: bool,

    /// Give up after this many consecutive failed recoveries.
    pub max_restarts: u32,

    /// Delay before each recovery attempt. Falls back to the orchestrator's
    /// recovery delays when unset.
    pub restart_delay_secs: Option<u64>,
}

impl RestartPolicy {
    pub fn restart_delay(&self) -> Option<Duration> {
        self.restart_delay_secs.map(Duration::from_secs)
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto_start: true,
            auto_restart: true,
            max_restarts: 5,
            restart_delay_secs: None,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in seconds.
    pub interval_secs: u64,

    /// Health check timeout in seconds.
    pub timeout_secs: u64,

    /// Number of consecutive failures before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successes before marking healthy.
    pub healthy_threshold: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 10,
            timeout_secs: 5,
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Orchestrator routing and isolation settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Errors tolerated before an instance is marked unhealthy (exceeding trips it).
    pub error_threshold: u32,

    /// Delay before the first recovery attempt.
    pub recovery_delay_secs: u64,

    /// Delay before each subsequent recovery attempt.
    pub recovery_retry_delay_secs: u64,

    /// Default per-request deadline.
    pub request_timeout_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            error_threshold: 3,
            recovery_delay_secs: 30,
            recovery_retry_delay_secs: 60,
            request_timeout_ms: 30_000,
        }
    }
}

impl OrchestratorSettings {
    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_delay_secs)
    }

    pub fn recovery_retry_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_retry_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Circuit breaker parameters.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures within the monitoring period that open the circuit.
    pub failure_threshold: u32,

    /// Cool-down before a probe is admitted.
    pub reset_timeout_ms: u64,

    /// Failures older than this no longer count towards the threshold.
    pub monitoring_period_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            monitoring_period_ms: 60_000,
        }
    }
}

/// Connection selection/eviction rule for pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    #[default]
    Lru,
    Lfu,
    Fifo,
    Random,
}

/// Connection pool parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_connections: usize,
    pub max_connections: usize,
    pub acquire_timeout_ms: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub validation_interval_secs: u64,
    pub eviction_policy: EvictionPolicy,
    pub health_check: PoolHealthCheckConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 1,
            max_connections: 10,
            acquire_timeout_ms: 5_000,
            idle_timeout_secs: 300,
            max_lifetime_secs: 3_600,
            validation_interval_secs: 60,
            eviction_policy: EvictionPolicy::Lru,
            health_check: PoolHealthCheckConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

/// Pool health check policy.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolHealthCheckConfig {
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// Consecutive failed pings before a connection is destroyed.
    pub max_failures: u32,
}

impl Default for PoolHealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            timeout_ms: 5_000,
            max_failures: 3,
        }
    }
}

/// Batch size and wait for one priority level.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PriorityBatch {
    pub batch_size: usize,
    pub max_wait_ms: u64,
}

/// Request batching parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BatchingConfig {
    /// Global cap on batch size, regardless of priority.
    pub max_batch_size: usize,

    /// Collapse identical in-flight requests.
    pub deduplication: bool,

    /// Deadline for a queued request, including dispatch.
    pub request_timeout_ms: u64,

    pub low: PriorityBatch,
    pub normal: PriorityBatch,
    pub high: PriorityBatch,
    pub critical: PriorityBatch,
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            deduplication: true,
            request_timeout_ms: 30_000,
            low: PriorityBatch {
                batch_size: 50,
                max_wait_ms: 100,
            },
            normal: PriorityBatch {
                batch_size: 20,
                max_wait_ms: 50,
            },
            high: PriorityBatch {
                batch_size: 5,
                max_wait_ms: 10,
            },
            critical: PriorityBatch {
                batch_size: 1,
                max_wait_ms: 0,
            },
        }
    }
}

/// Cache eviction rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheEvictionPolicy {
    #[default]
    Lru,
    Lfu,
    /// Entry expiring soonest.
    Ttl,
    Largest,
}

/// Response cache parameters.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size_bytes: usize,
    pub max_entries: usize,
    pub default_ttl_secs: u64,
    pub eviction_policy: CacheEvictionPolicy,
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_bytes: 10 * 1024 * 1024,
            max_entries: 1_000,
            default_ttl_secs: 300,
            eviction_policy: CacheEvictionPolicy::Lru,
            sweep_interval_secs: 60,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first.
    pub max_attempts: u32,

    /// Delay before the first retry in milliseconds.
    pub initial_delay_ms: u64,

    /// Growth factor per attempt.
    pub multiplier: f64,

    /// Maximum delay for exponential backoff in milliseconds.
    pub max_delay_ms: u64,

    /// Random jitter added on top of the delay, as a fraction of it.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 5_000,
            jitter_ratio: 0.1,
        }
    }
}

/// Backend selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log filter directive (e.g. "info" or "mcp_orchestrator=debug").
    pub log_level: String,

    /// "pretty" or "json".
    pub log_format: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "mcp_orchestrator=info,tower_http=info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
