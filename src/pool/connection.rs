//! Pooled connection and its lifecycle bookkeeping.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track usage (last used, use count, transfer and error counters)
//! - Evaluate the release/validation rules (idle, lifetime, error rate)

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Minimum uses before the error rate is trusted.
const ERROR_RATE_MIN_USES: u64 = 10;
/// Error rate above which a connection is retired.
const ERROR_RATE_LIMIT: f64 = 0.5;

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Wire protocol spoken over a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Tcp,
    WebSocket,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => write!(f, "http"),
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::WebSocket => write!(f, "websocket"),
        }
    }
}

/// Where a pool connects to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Endpoint {
    pub url: String,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(url: impl Into<String>, protocol: Protocol) -> Self {
        Self {
            url: url.into(),
            protocol,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.protocol, self.url)
    }
}

/// Why a connection is being retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    Idle,
    Lifetime,
    ErrorRate,
    Unhealthy,
    Evicted,
    Closed,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetireReason::Idle => "idle",
            RetireReason::Lifetime => "lifetime",
            RetireReason::ErrorRate => "error_rate",
            RetireReason::Unhealthy => "unhealthy",
            RetireReason::Evicted => "evicted",
            RetireReason::Closed => "closed",
        }
    }
}

/// A connection owned by a pool. While checked out, the holder owns it exclusively.
pub struct PooledConnection<C> {
    id: ConnectionId,
    endpoint: Arc<Endpoint>,
    created_at: Instant,
    last_used: Instant,
    usage_count: u64,
    is_active: bool,
    is_healthy: bool,
    failed_pings: u32,
    bytes_sent: u64,
    bytes_received: u64,
    error_count: u64,
    inner: C,
}

impl<C> PooledConnection<C> {
    pub(crate) fn new(inner: C, endpoint: Arc<Endpoint>) -> Self {
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            endpoint,
            created_at: now,
            last_used: now,
            usage_count: 0,
            is_active: false,
            is_healthy: true,
            failed_pings: 0,
            bytes_sent: 0,
            bytes_received: 0,
            error_count: 0,
            inner,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn protocol(&self) -> Protocol {
        self.endpoint.protocol
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn is_healthy(&self) -> bool {
        self.is_healthy
    }

    pub fn get(&self) -> &C {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    pub(crate) fn into_inner(self) -> C {
        self.inner
    }

    /// Account for a completed exchange.
    pub fn record_transfer(&mut self, sent: u64, received: u64) {
        self.bytes_sent = self.bytes_sent.saturating_add(sent);
        self.bytes_received = self.bytes_received.saturating_add(received);
        self.last_used = Instant::now();
    }

    pub fn record_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    /// Flag the connection as broken; it will be destroyed on release.
    pub fn mark_unhealthy(&mut self) {
        self.is_healthy = false;
    }

    pub fn error_rate(&self) -> f64 {
        if self.usage_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.usage_count as f64
        }
    }

    pub(crate) fn checkout(&mut self) {
        self.is_active = true;
        self.usage_count = self.usage_count.saturating_add(1);
        self.last_used = Instant::now();
    }

    /// Idle time keeps counting from the last checkout or transfer.
    pub(crate) fn checkin(&mut self) {
        self.is_active = false;
    }

    /// Ping bookkeeping; returns the consecutive failure count.
    pub(crate) fn record_ping(&mut self, ok: bool) -> u32 {
        if ok {
            self.failed_pings = 0;
        } else {
            self.failed_pings = self.failed_pings.saturating_add(1);
        }
        self.failed_pings
    }

    /// First retirement rule this connection violates, if any.
    pub(crate) fn violation(&self, idle_timeout: Duration, max_lifetime: Duration) -> Option<RetireReason> {
        let now = Instant::now();
        if !self.is_healthy {
            Some(RetireReason::Unhealthy)
        } else if now.duration_since(self.created_at) > max_lifetime {
            Some(RetireReason::Lifetime)
        } else if now.duration_since(self.last_used) > idle_timeout {
            Some(RetireReason::Idle)
        } else if self.usage_count >= ERROR_RATE_MIN_USES && self.error_rate() > ERROR_RATE_LIMIT {
            Some(RetireReason::ErrorRate)
        } else {
            None
        }
    }

    pub fn info(&self) -> ConnectionInfo {
        let now = Instant::now();
        ConnectionInfo {
            id: self.id,
            protocol: self.endpoint.protocol,
            endpoint: self.endpoint.url.clone(),
            age_ms: now.duration_since(self.created_at).as_millis() as u64,
            idle_ms: now.duration_since(self.last_used).as_millis() as u64,
            usage_count: self.usage_count,
            is_active: self.is_active,
            is_healthy: self.is_healthy,
            bytes_sent: self.bytes_sent,
            bytes_received: self.bytes_received,
            error_count: self.error_count,
        }
    }
}

impl<C> fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("usage_count", &self.usage_count)
            .field("is_active", &self.is_active)
            .field("is_healthy", &self.is_healthy)
            .finish()
    }
}

/// Serializable view of a connection.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub protocol: Protocol,
    pub endpoint: String,
    pub age_ms: u64,
    pub idle_ms: u64,
    pub usage_count: u64,
    pub is_active: bool,
    pub is_healthy: bool,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error_count: u64,
}
