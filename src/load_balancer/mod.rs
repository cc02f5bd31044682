//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrator::route_request
//!     → LoadBalancer::select_server(RouteContext)
//!     → registry.rs (registered instances, minus excluded/unhealthy, filtered by type)
//!     → Apply load balancing algorithm:
//!         - round_robin.rs (rotate through candidates)
//!         - least_conn.rs (pick candidate with fewest in-flight requests)
//!     → Return instance or None
//! ```
//!
//! # Design Decisions
//! - The orchestrator only sees the trait; strategies are swappable by config
//! - Unhealthy instances excluded from selection
//! - Exclusion by `mark_unhealthy` is independent of the instance's own flag

pub mod least_conn;
pub mod registry;
pub mod round_robin;

use std::sync::Arc;

use crate::config::LoadBalancingStrategy;
use crate::instance::ServerInstance;

pub use least_conn::LeastConnections;
pub use registry::ServerRegistry;
pub use round_robin::RoundRobin;

/// What the balancer may look at when choosing.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteContext<'a> {
    /// Restrict to instances of this server type.
    pub server_type: Option<&'a str>,
    pub method: &'a str,
}

/// Backend selection strategy consumed by the orchestrator.
pub trait LoadBalancer: Send + Sync {
    /// Pick an eligible instance, or None if there is none.
    fn select_server(&self, ctx: &RouteContext<'_>) -> Option<Arc<ServerInstance>>;

    fn add_server(&self, instance: Arc<ServerInstance>);

    fn remove_server(&self, id: &str);

    /// Stop selecting this instance until `mark_healthy`.
    fn mark_unhealthy(&self, id: &str);

    fn mark_healthy(&self, id: &str);
}

/// Build the configured strategy.
pub fn from_strategy(strategy: LoadBalancingStrategy) -> Arc<dyn LoadBalancer> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobin::new()),
        LoadBalancingStrategy::LeastConnections => Arc::new(LeastConnections::new()),
    }
}
