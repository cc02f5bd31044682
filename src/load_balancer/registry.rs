//! Instances known to a balancer.

use std::sync::{Arc, PoisonError, RwLock};

use dashmap::DashSet;

use crate::instance::ServerInstance;
use crate::load_balancer::RouteContext;

/// Registered instances in insertion order plus an exclusion set.
#[derive(Debug, Default)]
pub struct ServerRegistry {
    servers: RwLock<Vec<Arc<ServerInstance>>>,
    excluded: DashSet<String>,
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance, replacing any previous one with the same id.
    pub fn add(&self, instance: Arc<ServerInstance>) {
        let mut servers = self.servers.write().unwrap_or_else(PoisonError::into_inner);
        servers.retain(|s| s.id() != instance.id());
        self.excluded.remove(instance.id());
        servers.push(instance);
    }

    pub fn remove(&self, id: &str) {
        self.servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id() != id);
        self.excluded.remove(id);
    }

    pub fn exclude(&self, id: &str) {
        self.excluded.insert(id.to_string());
    }

    pub fn include(&self, id: &str) {
        self.excluded.remove(id);
    }

    /// Selectable instances for this request, in registration order.
    pub fn candidates(&self, ctx: &RouteContext<'_>) -> Vec<Arc<ServerInstance>> {
        self.servers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| ctx.server_type.map_or(true, |t| s.server_type() == t))
            .filter(|s| s.is_healthy() && !self.excluded.contains(s.id()))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load_balancer::tests::selectable;

    #[test]
    fn filters_by_type_health_and_exclusion() {
        let registry = ServerRegistry::new();
        let a = selectable("a", "search");
        let b = selectable("b", "search");
        let c = selectable("c", "files");
        registry.add(a.clone());
        registry.add(b.clone());
        registry.add(c);

        let search = RouteContext {
            server_type: Some("search"),
            method: "tools/call",
        };
        assert_eq!(registry.candidates(&search).len(), 2);
        assert_eq!(registry.candidates(&RouteContext::default()).len(), 3);

        registry.exclude("a");
        let ids: Vec<_> = registry.candidates(&search).iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["b"]);

        b.set_healthy(false);
        assert!(registry.candidates(&search).is_empty());

        registry.include("a");
        assert_eq!(registry.candidates(&search).len(), 1);

        registry.remove("a");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn re_adding_replaces() {
        let registry = ServerRegistry::new();
        registry.add(selectable("a", "x"));
        registry.exclude("a");
        registry.add(selectable("a", "x"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.candidates(&RouteContext::default()).len(), 1);
    }
}
