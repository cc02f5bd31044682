//! A bounded pool of connections to one endpoint.
//!
//! # Acquire path
//! ```text
//! idle connection (policy pick) → checkout
//!     else total < max          → create
//!     else                      → priority waiter, resolved by release or acquire timeout
//! ```
//!
//! # Invariants
//! - `idle + active + checking + creating <= max_connections`
//! - Waiters are served by priority, then arrival order
//! - Destruction below `min_connections` triggers replacement

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::{EvictionPolicy, PoolConfig};
use crate::error::{OrchestratorError, Result};
use crate::observability::metrics;
use crate::pool::connection::{ConnectionId, ConnectionInfo, Endpoint, PooledConnection, Protocol, RetireReason};
use crate::pool::factory::ConnectionFactory;
use crate::pool::policy::select_index;
use crate::priority::Priority;

/// Wait before retrying a failed background create while callers are queued.
const REPLENISH_RETRY: Duration = Duration::from_millis(250);

/// Per-call acquire parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcquireOptions {
    pub priority: Priority,
    /// Overrides the pool's acquire timeout.
    pub timeout: Option<Duration>,
}

impl AcquireOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            timeout: None,
        }
    }
}

struct Waiter<C> {
    priority: Priority,
    seq: u64,
    tx: oneshot::Sender<PooledConnection<C>>,
}

impl<C> PartialEq for Waiter<C> {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl<C> Eq for Waiter<C> {}

impl<C> PartialOrd for Waiter<C> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<C> Ord for Waiter<C> {
    // Max-heap: higher priority first, then lower sequence number.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolState<C> {
    idle: Vec<PooledConnection<C>>,
    active: HashSet<ConnectionId>,
    /// Idle connections temporarily out for a ping.
    checking: usize,
    /// Connections being established.
    creating: usize,
    waiters: BinaryHeap<Waiter<C>>,
    next_seq: u64,
    closed: bool,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.active.len() + self.checking + self.creating
    }

    /// Give a connection to the most urgent live waiter, or park it as idle.
    fn make_available(&mut self, mut conn: PooledConnection<C>) {
        while let Some(waiter) = self.waiters.pop() {
            let id = conn.id();
            match waiter.tx.send(conn) {
                Ok(()) => {
                    self.active.insert(id);
                    return;
                }
                // Waiter gave up; try the next one.
                Err(returned) => conn = returned,
            }
        }
        self.idle.push(conn);
    }
}

/// Point-in-time pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub endpoint: String,
    pub protocol: Protocol,
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub pending: usize,
    pub waiters: usize,
    pub min_connections: usize,
    pub max_connections: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub acquire_timeouts: u64,
    pub idle_connections: Vec<ConnectionInfo>,
}

/// Connection pool for a single endpoint.
pub struct ConnectionPool<F: ConnectionFactory> {
    name: String,
    endpoint: Arc<Endpoint>,
    config: PoolConfig,
    factory: Arc<F>,
    state: Mutex<PoolState<F::Connection>>,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
    acquire_timeouts: AtomicU64,
}

/// Removes a queued waiter when its acquire finishes or is dropped, and
/// returns a connection that was handed over too late.
struct PendingAcquire<'a, F: ConnectionFactory> {
    pool: &'a Arc<ConnectionPool<F>>,
    seq: u64,
    rx: oneshot::Receiver<PooledConnection<F::Connection>>,
}

impl<F: ConnectionFactory> Drop for PendingAcquire<'_, F> {
    fn drop(&mut self) {
        self.rx.close();
        if let Ok(conn) = self.rx.try_recv() {
            self.pool.release(conn);
        }
        let seq = self.seq;
        self.pool.lock().waiters.retain(|w| w.seq != seq);
    }
}

/// Holds one `creating` slot. Dropping it while still held gives the slot
/// back and lets queued waiters claim the capacity.
struct CreateSlot<'a, F: ConnectionFactory> {
    pool: &'a Arc<ConnectionPool<F>>,
    held: bool,
}

impl<F: ConnectionFactory> Drop for CreateSlot<'_, F> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let waiting = {
            let mut state = self.pool.lock();
            state.creating -= 1;
            !state.waiters.is_empty()
        };
        if waiting {
            self.pool.fill_capacity();
        }
    }
}

/// A checked-out connection that returns to its pool when dropped, also
/// when the future using it is cancelled mid-call.
pub struct Checkout<F: ConnectionFactory> {
    pool: Arc<ConnectionPool<F>>,
    conn: Option<PooledConnection<F::Connection>>,
}

impl<F: ConnectionFactory> Checkout<F> {
    pub fn new(pool: Arc<ConnectionPool<F>>, conn: PooledConnection<F::Connection>) -> Self {
        Self { pool, conn: Some(conn) }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<F>> {
        &self.pool
    }
}

impl<F: ConnectionFactory> Deref for Checkout<F> {
    type Target = PooledConnection<F::Connection>;

    fn deref(&self) -> &Self::Target {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for Checkout<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection is only taken on drop"),
        }
    }
}

impl<F: ConnectionFactory> Drop for Checkout<F> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    pub fn new(name: impl Into<String>, endpoint: Endpoint, config: PoolConfig, factory: Arc<F>) -> Self {
        Self {
            name: name.into(),
            endpoint: Arc::new(endpoint),
            config,
            factory,
            state: Mutex::new(PoolState {
                idle: Vec::new(),
                active: HashSet::new(),
                checking: 0,
                creating: 0,
                waiters: BinaryHeap::new(),
                next_seq: 0,
                closed: false,
            }),
            created_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
            acquire_timeouts: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState<F::Connection>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn closed_error(&self) -> OrchestratorError {
        OrchestratorError::Server(format!("pool '{}' is closed", self.name))
    }

    /// Check out a connection, waiting in priority order if the pool is exhausted.
    pub async fn acquire(self: &Arc<Self>, options: AcquireOptions) -> Result<PooledConnection<F::Connection>> {
        let wait = options.timeout.unwrap_or_else(|| self.config.acquire_timeout());
        let deadline = Instant::now() + wait;

        enum Next<C> {
            Ready(PooledConnection<C>),
            Create,
            Wait(u64, oneshot::Receiver<PooledConnection<C>>),
        }

        let mut retired = Vec::new();
        let next = {
            let mut state = self.lock();
            if state.closed {
                return Err(self.closed_error());
            }

            let mut picked = None;
            while let Some(i) = select_index(self.config.eviction_policy, &state.idle) {
                let conn = state.idle.swap_remove(i);
                match conn.violation(self.config.idle_timeout(), self.config.max_lifetime()) {
                    Some(reason) => retired.push((conn, reason)),
                    None => {
                        picked = Some(conn);
                        break;
                    }
                }
            }

            if let Some(mut conn) = picked {
                conn.checkout();
                state.active.insert(conn.id());
                Next::Ready(conn)
            } else if state.total() < self.config.max_connections {
                state.creating += 1;
                Next::Create
            } else {
                let seq = state.next_seq;
                state.next_seq += 1;
                let (tx, rx) = oneshot::channel();
                state.waiters.push(Waiter {
                    priority: options.priority,
                    seq,
                    tx,
                });
                Next::Wait(seq, rx)
            }
        };
        let replenish = !retired.is_empty();
        for (conn, reason) in retired {
            self.destroy(conn, reason);
        }
        if replenish {
            self.fill_capacity();
        }

        match next {
            Next::Ready(conn) => {
                tracing::trace!(pool = %self.name, conn = %conn.id(), "Reusing idle connection");
                Ok(conn)
            }
            Next::Create => self.create_checked_out(deadline).await,
            Next::Wait(seq, rx) => {
                tracing::debug!(pool = %self.name, priority = %options.priority, "Pool exhausted, queueing acquire");
                let mut pending = PendingAcquire { pool: self, seq, rx };
                match time::timeout_at(deadline, &mut pending.rx).await {
                    Ok(Ok(mut conn)) => {
                        conn.checkout();
                        Ok(conn)
                    }
                    Ok(Err(_)) => Err(self.closed_error()),
                    Err(_) => {
                        self.acquire_timeouts.fetch_add(1, Ordering::Relaxed);
                        metrics::record_pool_acquire_timeout(&self.name);
                        tracing::warn!(pool = %self.name, timeout = ?wait, "Acquire timed out");
                        Err(OrchestratorError::Timeout(format!(
                            "acquire from pool '{}' after {:?}",
                            self.name, wait
                        )))
                    }
                }
            }
        }
    }

    /// Check out a connection wrapped so that it is released on drop.
    pub async fn checkout(self: &Arc<Self>, options: AcquireOptions) -> Result<Checkout<F>> {
        let conn = self.acquire(options).await?;
        Ok(Checkout::new(Arc::clone(self), conn))
    }

    async fn create_checked_out(self: &Arc<Self>, deadline: Instant) -> Result<PooledConnection<F::Connection>> {
        let mut slot = CreateSlot { pool: self, held: true };
        let result = time::timeout_at(deadline, self.factory.connect(&self.endpoint)).await;

        let inner = match result {
            Ok(Ok(inner)) => inner,
            Ok(Err(e)) => {
                tracing::warn!(pool = %self.name, error = %e, "Failed to create connection");
                return Err(e);
            }
            Err(_) => {
                return Err(OrchestratorError::Timeout(format!(
                    "connect to {} for pool '{}'",
                    self.endpoint.url, self.name
                )))
            }
        };

        slot.held = false;
        let mut state = self.lock();
        state.creating -= 1;
        let mut conn = PooledConnection::new(inner, Arc::clone(&self.endpoint));
        self.created_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_connection_created(&self.name);

        if state.closed {
            drop(state);
            self.destroy(conn, RetireReason::Closed);
            return Err(self.closed_error());
        }
        conn.checkout();
        state.active.insert(conn.id());
        tracing::debug!(pool = %self.name, conn = %conn.id(), total = state.total(), "Created connection");
        Ok(conn)
    }

    /// Return a checked-out connection.
    ///
    /// Connections breaking the idle, lifetime, health or error-rate rules
    /// are destroyed instead of reused.
    pub fn release(self: &Arc<Self>, mut conn: PooledConnection<F::Connection>) {
        conn.checkin();
        let mut state = self.lock();
        if !state.active.remove(&conn.id()) {
            drop(state);
            tracing::warn!(pool = %self.name, conn = %conn.id(), "Released connection not owned by pool");
            self.destroy(conn, RetireReason::Closed);
            return;
        }
        if state.closed {
            drop(state);
            self.destroy(conn, RetireReason::Closed);
            return;
        }
        if let Some(reason) = conn.violation(self.config.idle_timeout(), self.config.max_lifetime()) {
            drop(state);
            self.destroy(conn, reason);
            self.fill_capacity();
            return;
        }
        state.make_available(conn);
        self.report_size(&state);
    }

    /// Destroy the idle connection the eviction policy selects.
    pub fn evict(self: &Arc<Self>) -> Option<ConnectionId> {
        let conn = {
            let mut state = self.lock();
            let i = select_index(self.config.eviction_policy, &state.idle)?;
            state.idle.swap_remove(i)
        };
        let id = conn.id();
        self.destroy(conn, RetireReason::Evicted);
        self.fill_capacity();
        Some(id)
    }

    /// Proactively retire idle connections that break a rule. Returns how many were retired.
    pub fn validate(self: &Arc<Self>) -> usize {
        let retired: Vec<_> = {
            let mut state = self.lock();
            let idle = std::mem::take(&mut state.idle);
            let mut retired = Vec::new();
            for conn in idle {
                match conn.violation(self.config.idle_timeout(), self.config.max_lifetime()) {
                    Some(reason) => retired.push((conn, reason)),
                    None => state.idle.push(conn),
                }
            }
            retired
        };
        let count = retired.len();
        for (conn, reason) in retired {
            self.destroy(conn, reason);
        }
        if count > 0 {
            tracing::debug!(pool = %self.name, retired = count, "Validation retired connections");
        }
        self.fill_capacity();
        count
    }

    /// Ping every idle connection. Active connections are skipped.
    pub async fn health_check(self: &Arc<Self>) {
        let batch: Vec<_> = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let idle = std::mem::take(&mut state.idle);
            state.checking += idle.len();
            idle
        };

        let ping_timeout = Duration::from_millis(self.config.health_check.timeout_ms);
        for mut conn in batch {
            let ok = matches!(
                time::timeout(ping_timeout, self.factory.ping(conn.get_mut())).await,
                Ok(Ok(()))
            );
            let failures = conn.record_ping(ok);
            if failures >= self.config.health_check.max_failures {
                conn.mark_unhealthy();
            }

            let mut state = self.lock();
            state.checking -= 1;
            if !conn.is_healthy() {
                drop(state);
                tracing::warn!(pool = %self.name, conn = %conn.id(), failures, "Connection failed health checks");
                self.destroy(conn, RetireReason::Unhealthy);
            } else if state.closed {
                drop(state);
                self.destroy(conn, RetireReason::Closed);
            } else {
                state.make_available(conn);
            }
        }
        self.fill_capacity();
    }

    /// Create connections in the background until `min_connections` (plus
    /// one per queued waiter) is reached, never exceeding the maximum.
    pub fn fill_capacity(self: &Arc<Self>) {
        let missing = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            let wanted = (self.config.min_connections + state.waiters.len()).min(self.config.max_connections);
            let missing = wanted.saturating_sub(state.total());
            state.creating += missing;
            missing
        };
        for _ in 0..missing {
            let pool = Arc::clone(self);
            tokio::spawn(async move { pool.create_available().await });
        }
    }

    async fn create_available(self: Arc<Self>) {
        let result = time::timeout(self.config.acquire_timeout(), self.factory.connect(&self.endpoint)).await;
        let outcome = match result {
            Ok(Ok(inner)) => Ok(inner),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err("timed out".to_string()),
        };
        if self.finish_create(outcome) {
            time::sleep(REPLENISH_RETRY).await;
            self.fill_capacity();
        }
    }

    /// Settle a background create. Returns true when it failed while
    /// callers are still queued for capacity.
    fn finish_create(&self, outcome: std::result::Result<F::Connection, String>) -> bool {
        let mut state = self.lock();
        state.creating -= 1;
        match outcome {
            Ok(inner) => {
                let conn = PooledConnection::new(inner, Arc::clone(&self.endpoint));
                self.created_total.fetch_add(1, Ordering::Relaxed);
                metrics::record_pool_connection_created(&self.name);
                if state.closed {
                    drop(state);
                    self.destroy(conn, RetireReason::Closed);
                } else {
                    tracing::debug!(pool = %self.name, conn = %conn.id(), "Replenished connection");
                    state.make_available(conn);
                    self.report_size(&state);
                }
                false
            }
            Err(e) => {
                tracing::warn!(pool = %self.name, error = %e, "Failed to replenish connection");
                !state.closed && !state.waiters.is_empty()
            }
        }
    }

    fn destroy(&self, conn: PooledConnection<F::Connection>, reason: RetireReason) {
        self.destroyed_total.fetch_add(1, Ordering::Relaxed);
        metrics::record_pool_connection_destroyed(&self.name, reason.as_str());
        tracing::debug!(pool = %self.name, conn = %conn.id(), reason = reason.as_str(), "Destroying connection");
        tokio::spawn(self.factory.close(conn.into_inner()));
    }

    fn report_size(&self, state: &PoolState<F::Connection>) {
        metrics::record_pool_size(&self.name, state.idle.len(), state.active.len(), state.waiters.len());
    }

    /// Run health checks and validation until shutdown or close.
    pub fn start_maintenance(self: &Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut health = time::interval(Duration::from_secs(pool.config.health_check.interval_secs.max(1)));
            let mut validation = time::interval(Duration::from_secs(pool.config.validation_interval_secs.max(1)));
            // Both tickers fire immediately; skip that first round.
            health.tick().await;
            validation.tick().await;
            pool.fill_capacity();

            loop {
                tokio::select! {
                    _ = health.tick() => pool.health_check().await,
                    _ = validation.tick() => {
                        pool.validate();
                    }
                    _ = shutdown.recv() => break,
                }
                if pool.lock().closed {
                    break;
                }
            }
            tracing::debug!(pool = %pool.name, "Pool maintenance stopped");
        })
    }

    /// Close the pool: idle connections are destroyed, waiters rejected,
    /// and active connections destroyed when released.
    pub fn close(&self) {
        let idle = {
            let mut state = self.lock();
            state.closed = true;
            // Dropping the senders rejects every waiter.
            state.waiters.clear();
            std::mem::take(&mut state.idle)
        };
        for conn in idle {
            self.destroy(conn, RetireReason::Closed);
        }
        tracing::info!(pool = %self.name, "Pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            name: self.name.clone(),
            endpoint: self.endpoint.url.clone(),
            protocol: self.endpoint.protocol,
            total: state.total(),
            idle: state.idle.len(),
            active: state.active.len(),
            pending: state.checking + state.creating,
            waiters: state.waiters.len(),
            min_connections: self.config.min_connections,
            max_connections: self.config.max_connections,
            created_total: self.created_total.load(Ordering::Relaxed),
            destroyed_total: self.destroyed_total.load(Ordering::Relaxed),
            acquire_timeouts: self.acquire_timeouts.load(Ordering::Relaxed),
            idle_connections: state.idle.iter().map(PooledConnection::info).collect(),
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        self.config.eviction_policy
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::time::advance;

    /// Factory producing numbered dummy connections.
    #[derive(Default)]
    pub(crate) struct MockFactory {
        pub connects: AtomicUsize,
        pub closes: Arc<AtomicUsize>,
        pub fail_pings: AtomicBool,
        /// Connects left to refuse.
        pub refuse: AtomicUsize,
        pub connect_delay_ms: AtomicU64,
    }

    impl ConnectionFactory for MockFactory {
        type Connection = usize;

        fn connect(&self, _endpoint: &Endpoint) -> BoxFuture<'static, Result<usize>> {
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            let delay = Duration::from_millis(self.connect_delay_ms.load(Ordering::SeqCst));
            Box::pin(async move {
                if !delay.is_zero() {
                    time::sleep(delay).await;
                }
                if refused {
                    Err(OrchestratorError::Network("refused".into()))
                } else {
                    Ok(n)
                }
            })
        }

        fn ping<'a>(&'a self, _conn: &'a mut usize) -> BoxFuture<'a, Result<()>> {
            let fail = self.fail_pings.load(Ordering::SeqCst);
            Box::pin(async move {
                if fail {
                    Err(OrchestratorError::Network("ping failed".into()))
                } else {
                    Ok(())
                }
            })
        }

        fn close(&self, _conn: usize) -> BoxFuture<'static, ()> {
            let closes = Arc::clone(&self.closes);
            Box::pin(async move {
                closes.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    fn pool_with(config: PoolConfig) -> Arc<ConnectionPool<MockFactory>> {
        pool_with_factory(config, MockFactory::default())
    }

    fn pool_with_factory(config: PoolConfig, factory: MockFactory) -> Arc<ConnectionPool<MockFactory>> {
        Arc::new(ConnectionPool::new(
            "test",
            Endpoint::new("tcp://127.0.0.1:1", Protocol::Tcp),
            config,
            Arc::new(factory),
        ))
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min_connections: min,
            max_connections: max,
            acquire_timeout_ms: 1_000,
            ..PoolConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_and_sixth_acquire_times_out() {
        let pool = pool_with(config(0, 5));
        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire(AcquireOptions::default()).await.unwrap());
        }
        assert_eq!(pool.stats().total, 5);

        let err = pool.acquire(AcquireOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));
        let stats = pool.stats();
        assert_eq!(stats.total, 5);
        assert_eq!(stats.waiters, 0, "timed-out waiter must be removed");
        assert_eq!(stats.acquire_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_acquire_resumes_on_release() {
        let pool = pool_with(config(0, 1));
        let first = pool.acquire(AcquireOptions::default()).await.unwrap();
        let first_id = first.id();

        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(AcquireOptions::default()).await })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.stats().waiters, 1);

        pool.release(first);
        let second = waiter.await.unwrap().unwrap();
        assert_eq!(second.id(), first_id);
        assert_eq!(second.usage_count(), 2);
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_by_priority_then_arrival() {
        let pool = pool_with(config(0, 1));
        let held = pool.acquire(AcquireOptions::default()).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tasks = Vec::new();
        for (label, priority) in [
            ("low", Priority::Low),
            ("normal-1", Priority::Normal),
            ("high", Priority::High),
            ("normal-2", Priority::Normal),
        ] {
            let pool = Arc::clone(&pool);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let conn = pool
                    .acquire(AcquireOptions {
                        priority,
                        timeout: Some(Duration::from_secs(60)),
                    })
                    .await
                    .unwrap();
                order.lock().unwrap().push(label);
                tokio::task::yield_now().await;
                pool.release(conn);
            }));
            tokio::task::yield_now().await;
        }
        assert_eq!(pool.stats().waiters, 4);

        pool.release(held);
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["high", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_release_destroys_and_replenishes_to_min() {
        let mut cfg = config(2, 5);
        cfg.idle_timeout_secs = 10;
        let pool = pool_with(cfg);

        let a = pool.acquire(AcquireOptions::default()).await.unwrap();
        let b = pool.acquire(AcquireOptions::default()).await.unwrap();
        pool.release(b);

        time::advance(Duration::from_secs(11)).await;
        pool.release(a);
        // Let the replacement task and the close task run.
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }

        let stats = pool.stats();
        assert_eq!(stats.destroyed_total, 1);
        assert_eq!(stats.total, 2, "pool must be back at min_connections");
        assert_eq!(pool.factory.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_idle_connection_is_skipped_on_acquire() {
        let mut cfg = config(0, 5);
        cfg.idle_timeout_secs = 10;
        let pool = pool_with(cfg);

        let a = pool.acquire(AcquireOptions::default()).await.unwrap();
        let stale = a.id();
        pool.release(a);
        time::advance(Duration::from_secs(11)).await;

        let fresh = pool.acquire(AcquireOptions::default()).await.unwrap();
        assert_ne!(fresh.id(), stale);
        assert_eq!(pool.stats().destroyed_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn evict_follows_lfu_policy() {
        let mut cfg = config(0, 3);
        cfg.eviction_policy = EvictionPolicy::Lfu;
        let pool = pool_with(cfg);

        let a = pool.acquire(AcquireOptions::default()).await.unwrap();
        let b = pool.acquire(AcquireOptions::default()).await.unwrap();
        let often_used = a.id();
        let rarely_used = b.id();
        pool.release(b);
        pool.release(a);

        // Equal use counts tie-break on the older id, so `a` is reused.
        let again = pool.acquire(AcquireOptions::default()).await.unwrap();
        assert_eq!(again.id(), often_used);
        pool.release(again);

        assert_eq!(pool.evict(), Some(rarely_used));
        assert_eq!(pool.stats().idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_pings_destroy_connection() {
        let mut cfg = config(0, 2);
        cfg.health_check.max_failures = 2;
        let pool = pool_with(cfg);
        let conn = pool.acquire(AcquireOptions::default()).await.unwrap();
        pool.release(conn);

        pool.factory.fail_pings.store(true, Ordering::SeqCst);
        pool.health_check().await;
        assert_eq!(pool.stats().idle, 1);
        pool.health_check().await;
        assert_eq!(pool.stats().idle, 0);
        assert_eq!(pool.stats().destroyed_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn validation_retires_expired_connections() {
        let mut cfg = config(0, 3);
        cfg.max_lifetime_secs = 5;
        cfg.idle_timeout_secs = 100;
        let pool = pool_with(cfg);
        let conn = pool.acquire(AcquireOptions::default()).await.unwrap();
        pool.release(conn);

        time::advance(Duration::from_secs(6)).await;
        assert_eq!(pool.validate(), 1);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_rejects_waiters_and_new_acquires() {
        let pool = pool_with(config(0, 1));
        let held = pool.acquire(AcquireOptions::default()).await.unwrap();
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(AcquireOptions::default()).await })
        };
        tokio::task::yield_now().await;

        pool.close();
        assert!(matches!(waiter.await.unwrap(), Err(OrchestratorError::Server(_))));
        assert!(pool.acquire(AcquireOptions::default()).await.is_err());

        pool.release(held);
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_checkout_returns_connection() {
        let pool = pool_with(config(0, 1));
        let call = {
            let pool = Arc::clone(&pool);
            async move {
                let _conn = pool.checkout(AcquireOptions::default()).await?;
                time::sleep(Duration::from_secs(60)).await;
                Ok::<_, OrchestratorError>(())
            }
        };
        assert!(time::timeout(Duration::from_secs(1), call).await.is_err());

        let stats = pool.stats();
        assert_eq!((stats.total, stats.idle, stats.active), (1, 1, 0));
        let again = pool.checkout(AcquireOptions::default()).await.unwrap();
        assert_eq!(again.usage_count(), 2);
        drop(again);
        assert_eq!(pool.stats().active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_create_frees_its_slot() {
        let factory = MockFactory::default();
        factory.connect_delay_ms.store(5_000, Ordering::SeqCst);
        let pool = pool_with_factory(config(0, 1), factory);

        let attempt = time::timeout(Duration::from_millis(100), pool.acquire(AcquireOptions::default())).await;
        assert!(attempt.is_err());
        assert_eq!(pool.stats().total, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_retiring_idle_connections_replenishes_to_min() {
        let mut cfg = config(3, 5);
        cfg.idle_timeout_secs = 10;
        let pool = pool_with(cfg);

        let held: Vec<_> = futures_util::future::join_all((0..3).map(|_| pool.acquire(AcquireOptions::default())))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        for conn in held {
            pool.release(conn);
        }
        assert_eq!(pool.stats().idle, 3);

        advance(Duration::from_secs(11)).await;
        let conn = pool.acquire(AcquireOptions::default()).await.unwrap();
        settle().await;

        let stats = pool.stats();
        assert_eq!(stats.destroyed_total, 3);
        assert!(stats.total >= 3, "pool shrank to {}", stats.total);
        assert_eq!(stats.active, 1);
        pool.release(conn);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_gets_capacity_freed_by_failed_create() {
        let factory = MockFactory::default();
        factory.refuse.store(1, Ordering::SeqCst);
        factory.connect_delay_ms.store(100, Ordering::SeqCst);
        let pool = pool_with_factory(config(0, 1), factory);

        let creator = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(AcquireOptions::default()).await })
        };
        settle().await;
        let waiter = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.acquire(AcquireOptions::default()).await })
        };
        settle().await;
        assert_eq!(pool.stats().waiters, 1);

        let refused = creator.await.unwrap().unwrap_err();
        assert_eq!(refused, OrchestratorError::Network("refused".into()));
        let conn = time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter served before its acquire timeout")
            .unwrap()
            .unwrap();
        assert_eq!(pool.stats().active, 1);
        pool.release(conn);
    }
}
