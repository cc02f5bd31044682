//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::instance::ServerInstance;
use crate::load_balancer::{LoadBalancer, RouteContext, ServerRegistry};

/// Round-robin selector.
/// Stores an internal counter to rotate through eligible instances.
#[derive(Debug, Default)]
pub struct RoundRobin {
    servers: ServerRegistry,
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancer for RoundRobin {
    fn select_server(&self, ctx: &RouteContext<'_>) -> Option<Arc<ServerInstance>> {
        let candidates = self.servers.candidates(ctx);
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(index).cloned()
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::tests::selectable;

    #[test]
    fn test_round_robin() {
        let lb = RoundRobin::new();
        lb.add_server(selectable("b1", "default"));
        lb.add_server(selectable("b2", "default"));
        let ctx = RouteContext::default();

        assert_eq!(lb.select_server(&ctx).unwrap().id(), "b1");
        assert_eq!(lb.select_server(&ctx).unwrap().id(), "b2");
        assert_eq!(lb.select_server(&ctx).unwrap().id(), "b1");
    }

    #[test]
    fn skips_unhealthy_and_returns_none_when_empty() {
        let lb = RoundRobin::new();
        lb.add_server(selectable("b1", "default"));
        lb.add_server(selectable("b2", "default"));
        let ctx = RouteContext::default();

        lb.mark_unhealthy("b1");
        for _ in 0..3 {
            assert_eq!(lb.select_server(&ctx).unwrap().id(), "b2");
        }
        lb.mark_unhealthy("b2");
        assert!(lb.select_server(&ctx).is_none());

        lb.mark_healthy("b1");
        assert_eq!(lb.select_server(&ctx).unwrap().id(), "b1");
    }
}
