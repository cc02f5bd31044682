//! Least Connections load balancing strategy.

use std::sync::Arc;

use crate::instance::ServerInstance;
use crate::load_balancer::{LoadBalancer, RouteContext, ServerRegistry};

/// Least connections selector.
/// Selects the instance with the fewest in-flight requests.
#[derive(Debug, Default)]
pub struct LeastConnections {
    servers: ServerRegistry,
}

impl LeastConnections {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for LeastConnections {
    fn select_server(&self, ctx: &RouteContext<'_>) -> Option<Arc<ServerInstance>> {
        // In case of tie, the first registered one is selected (stability)
        self.servers
            .candidates(ctx)
            .into_iter()
            .min_by_key(|s| s.in_flight())
    }

    fn add_server(&self, instance: Arc<ServerInstance>) {
        self.servers.add(instance);
    }

    fn remove_server(&self, id: &str) {
        self.servers.remove(id);
    }

    fn mark_unhealthy(&self, id: &str) {
        self.servers.exclude(id);
    }

    fn mark_healthy(&self, id: &str) {
        self.servers.include(id);
    }
}
