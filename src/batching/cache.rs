//! Response cache with TTL, size accounting and policy-driven eviction.
//!
//! # Invariants
//! - Total serialized size never exceeds `max_size_bytes`
//! - Entry count never exceeds `max_entries`
//! - An expired entry is never returned, swept or not

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::{CacheConfig, CacheEvictionPolicy};
use crate::observability::metrics;

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Value,
    created_at: Instant,
    expires_at: Instant,
    access_count: u64,
    last_accessed: Instant,
    size: usize,
    /// Insertion order, breaks ties between otherwise equal candidates.
    seq: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    bytes: usize,
    next_seq: u64,
}

impl CacheState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.bytes -= entry.size;
        Some(entry)
    }

    /// Key the policy would evict next.
    fn victim(&self, policy: CacheEvictionPolicy) -> Option<String> {
        let entries = self.entries.iter();
        let chosen = match policy {
            CacheEvictionPolicy::Lru => entries.min_by_key(|(_, e)| (e.last_accessed, e.seq)),
            CacheEvictionPolicy::Lfu => entries.min_by_key(|(_, e)| (e.access_count, e.seq)),
            CacheEvictionPolicy::Ttl => entries.min_by_key(|(_, e)| (e.expires_at, e.seq)),
            CacheEvictionPolicy::Largest => {
                entries.max_by_key(|(_, e)| (e.size, std::cmp::Reverse(e.seq)))
            }
        };
        chosen.map(|(key, _)| key.clone())
    }
}

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: usize,
    pub bytes: usize,
    pub hit_rate: f64,
}

pub struct ResponseCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.config.default_ttl_secs)
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Live value for `key`. Expired entries are dropped on the way.
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.config.enabled {
            return None;
        }
        let now = Instant::now();
        let mut state = self.lock();
        let value = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.access_count += 1;
                entry.last_accessed = now;
                Some(entry.value.clone())
            }
            Some(_) => {
                state.remove(key);
                None
            }
            None => None,
        };
        drop(state);

        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup(value.is_some());
        value
    }

    /// Insert, evicting by policy until the entry fits. Returns false when the
    /// value alone is larger than the whole cache.
    pub fn set(&self, key: impl Into<String>, value: Value, ttl: Option<Duration>) -> bool {
        if !self.config.enabled {
            return false;
        }
        let key = key.into();
        let size = key.len() + serde_json::to_vec(&value).map(|v| v.len()).unwrap_or(0);
        if size > self.config.max_size_bytes || self.config.max_entries == 0 {
            tracing::debug!(key = %key, size, "Value too large to cache");
            return false;
        }

        let now = Instant::now();
        let ttl = ttl.unwrap_or_else(|| self.default_ttl());
        let mut state = self.lock();
        state.remove(&key);

        let mut evicted = 0;
        while state.entries.len() >= self.config.max_entries
            || state.bytes + size > self.config.max_size_bytes
        {
            let Some(victim) = state.victim(self.config.eviction_policy) else {
                break;
            };
            state.remove(&victim);
            evicted += 1;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.bytes += size;
        state.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl,
                access_count: 0,
                last_accessed: now,
                size,
                seq,
            },
        );
        let (entries, bytes) = (state.entries.len(), state.bytes);
        drop(state);

        if evicted > 0 {
            self.evictions.fetch_add(evicted, Ordering::Relaxed);
            for _ in 0..evicted {
                metrics::record_cache_eviction("capacity");
            }
        }
        metrics::record_cache_usage(entries, bytes, self.hit_rate());
        true
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.bytes = 0;
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        let (entries, bytes) = (state.entries.len(), state.bytes);
        drop(state);

        for _ in &expired {
            metrics::record_cache_eviction("expired");
        }
        metrics::record_cache_usage(entries, bytes, self.hit_rate());
        expired.len()
    }

    /// Periodic sweep until shutdown.
    pub fn start_sweeper(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let period = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = cache.sweep();
                        if removed > 0 {
                            tracing::debug!(removed, "Swept expired cache entries");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            entries: state.entries.len(),
            bytes: state.bytes,
            hit_rate: self.hit_rate(),
        }
    }

    /// Age of an entry, for diagnostics.
    pub fn age(&self, key: &str) -> Option<Duration> {
        self.lock().entries.get(key).map(|e| e.created_at.elapsed())
    }
}
