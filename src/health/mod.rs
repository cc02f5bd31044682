//! Health checking subsystem.
//!
//! # Data Flow
//! ```text
//! Active health checks (active.rs):
//!     Per-instance timer
//!     → ServerInstance::health_check
//!     → Update state.rs
//!     → HealthEvent on transition
//!
//! Exit notifications:
//!     Instance reports unexpected exit
//!     → Forced to Unhealthy, event emitted at once
//!
//! State machine (state.rs):
//!     Healthy ←→ Unhealthy
//!     With thresholds to prevent flapping
//! ```
//!
//! # Design Decisions
//! - The orchestrator only consumes events; it never polls the monitor
//! - State transitions require consecutive successes/failures
//! - Health state is per-instance

pub mod active;
pub mod state;

use std::sync::Arc;

use crate::instance::ServerInstance;

pub use active::IntervalHealthMonitor;
pub use state::{HealthState, Transition};

/// Transition notifications consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    Unhealthy(String),
    Recovered(String),
}

impl HealthEvent {
    pub fn server_id(&self) -> &str {
        match self {
            HealthEvent::Unhealthy(id) | HealthEvent::Recovered(id) => id,
        }
    }
}

/// Watches registered instances and reports health transitions.
pub trait HealthMonitor: Send + Sync {
    fn monitor(&self, instance: Arc<ServerInstance>);

    fn unmonitor(&self, id: &str);
}
