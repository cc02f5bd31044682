//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, requests pass through
//! - Open: backend assumed down, requests fail fast
//! - Half-Open: one probe admitted to test recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: failure_count >= threshold within monitoring period
//! Open → Half-Open: first is_open() check after reset_timeout since last failure
//! Half-Open → Closed: probe request succeeds
//! Half-Open → Open: probe request fails
//! any → Closed: reset() or any recorded success
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global)
//! - Fail fast in Open state (no waiting for timeout)
//! - Single probe in Half-Open (prevents hammering recovering backend)

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::CircuitBreakerConfig;
use crate::observability::metrics;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for the state gauge.
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// Point-in-time view of a breaker, for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_ms_ago: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
}

/// Failure counter and three-state gate for one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    server_id: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    monitoring_period: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(server_id: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        let breaker = Self {
            server_id: server_id.into(),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: Duration::from_millis(config.reset_timeout_ms),
            monitoring_period: Duration::from_millis(config.monitoring_period_ms),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
            }),
        };
        metrics::record_circuit_state(&breaker.server_id, CircuitState::Closed);
        breaker
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admission check. Returns false exactly once per cool-down after the
    /// reset timeout has elapsed, so the next call acts as a live probe.
    pub fn is_open(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let cooled_down = inner
                    .last_failure
                    .map(|at| at.elapsed() >= self.reset_timeout)
                    .unwrap_or(true);
                if cooled_down {
                    inner.state = CircuitState::HalfOpen;
                    drop(inner);
                    tracing::info!(server = %self.server_id, "Circuit half-open, admitting probe");
                    metrics::record_circuit_state(&self.server_id, CircuitState::HalfOpen);
                    false
                } else {
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        inner.failure_count = 0;
        inner.state = CircuitState::Closed;
        drop(inner);

        if previous != CircuitState::Closed {
            tracing::info!(server = %self.server_id, from = ?previous, "Circuit closed");
            metrics::record_circuit_state(&self.server_id, CircuitState::Closed);
        }
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut inner = self.lock();

        if inner.state == CircuitState::Closed {
            let stale = inner
                .last_failure
                .map(|at| now.duration_since(at) > self.monitoring_period)
                .unwrap_or(false);
            if stale {
                inner.failure_count = 0;
            }
        }

        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(now);

        let opened = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if opened {
            inner.state = CircuitState::Open;
        }
        let failures = inner.failure_count;
        drop(inner);

        if opened {
            tracing::warn!(
                server = %self.server_id,
                failures,
                reset_timeout = ?self.reset_timeout,
                "Circuit opened"
            );
            metrics::record_circuit_state(&self.server_id, CircuitState::Open);
        }
    }

    /// Externally triggered recovery.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        drop(inner);
        tracing::debug!(server = %self.server_id, "Circuit reset");
        metrics::record_circuit_state(&self.server_id, CircuitState::Closed);
    }

    /// Current state without triggering the Open → Half-Open transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_ms_ago: inner
                .last_failure
                .map(|at| at.elapsed().as_millis() as u64),
        }
    }
}
