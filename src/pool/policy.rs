//! Connection choice under the configured eviction policy.
//!
//! The same rule picks which idle connection to hand out and which one to
//! evict, so behaviour is deterministic for every policy but `random`.

use crate::config::EvictionPolicy;
use crate::pool::connection::PooledConnection;

/// Index of the connection the policy selects, or None if `candidates` is empty.
///
/// - lru: oldest `last_used`
/// - lfu: fewest uses
/// - fifo: oldest `created_at`
/// - random: uniform
///
/// Ties break on the lower connection id.
pub fn select_index<C>(policy: EvictionPolicy, candidates: &[PooledConnection<C>]) -> Option<usize> {
    if candidates.is_empty() {
        return None;
    }
    let indexed = candidates.iter().enumerate();
    let picked = match policy {
        EvictionPolicy::Lru => indexed.min_by_key(|(_, c)| (c.last_used(), c.id())),
        EvictionPolicy::Lfu => indexed.min_by_key(|(_, c)| (c.usage_count(), c.id())),
        EvictionPolicy::Fifo => indexed.min_by_key(|(_, c)| (c.created_at(), c.id())),
        EvictionPolicy::Random => return Some(fastrand::usize(..candidates.len())),
    };
    picked.map(|(i, _)| i)
}
