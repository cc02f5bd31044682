//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! Call to backend:
//!     → circuit_breaker.rs (admission: reject while OPEN)
//!     → timeouts.rs (enforce the caller's deadline)
//!     → On transient failure: retries.rs (retry with backoff.rs delays)
//!     → circuit_breaker.rs (record outcome, open circuit if threshold exceeded)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every external call has a deadline
//! - Retries only for transient errors (network, timeout)
//! - Circuit breaker prevents cascading failures
//! - Breaker state is in-memory only and starts CLOSED on every process start

pub mod backoff;
pub mod circuit_breaker;
pub mod retries;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState};
pub use retries::RetryPolicy;
pub use timeouts::with_timeout;
