//! Request coalescing by server type and priority.
//!
//! # Data Flow
//! ```text
//! add_request(method, params, server_type, options)
//!     → cache hit? return it
//!     → identical request in flight? attach to its result
//!     → queue (server_type, priority)
//!         flush when: critical | size limit | max wait since last add
//!     → dispatch: group by method, one batched call per group
//!         success → match items by id, resolve each waiter, fill cache
//!         failure → each item once more on its own, then reject
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::Value;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::batching::cache::ResponseCache;
use crate::batching::executor::BatchExecutor;
use crate::config::{BatchingConfig, PriorityBatch};
use crate::error::{OrchestratorError, Result};
use crate::observability::metrics;
use crate::priority::Priority;
use crate::protocol::{RpcRequest, RpcResponse};
use crate::resilience::RetryPolicy;

/// Builds the deduplication key from `(server_type, method, params)`.
pub type DedupKeyFn = dyn Fn(&str, &str, Option<&Value>) -> String + Send + Sync;

fn default_dedup_key(server_type: &str, method: &str, params: Option<&Value>) -> String {
    match params {
        Some(params) => format!("{}:{}:{}", server_type, method, params),
        None => format!("{}:{}", server_type, method),
    }
}

/// Per-call knobs for `add_request`.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: Priority,
    /// Serve from and store into the response cache under this key.
    pub cache_key: Option<String>,
    pub cache_ttl: Option<Duration>,
    /// Overrides the engine's deduplication key.
    pub dedup_key: Option<String>,
    pub timeout: Option<Duration>,
}

impl RequestOptions {
    pub fn with_priority(priority: Priority) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }

    pub fn cached(mut self, key: impl Into<String>) -> Self {
        self.cache_key = Some(key.into());
        self
    }
}

struct BatchRequest {
    id: String,
    method: String,
    params: Option<Value>,
    created_at: Instant,
    cache_key: Option<String>,
    cache_ttl: Option<Duration>,
    dedup: Option<(String, u64)>,
    reply: oneshot::Sender<Result<Value>>,
}

impl BatchRequest {
    fn envelope(&self) -> RpcRequest {
        RpcRequest::new(self.method.clone(), self.params.clone()).with_id(self.id.clone())
    }
}

#[derive(Default)]
struct Queue {
    requests: Vec<BatchRequest>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

impl Queue {
    fn drain(&mut self) -> Vec<BatchRequest> {
        self.generation += 1;
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        std::mem::take(&mut self.requests)
    }
}

type QueueKey = (String, Priority);
type SharedResult = Shared<BoxFuture<'static, Result<Value>>>;

struct InFlight {
    id: u64,
    result: SharedResult,
}

#[derive(Default)]
struct DedupTable {
    entries: HashMap<String, InFlight>,
    next_id: u64,
}

pub struct BatchingEngine<E: BatchExecutor> {
    config: BatchingConfig,
    executor: Arc<E>,
    cache: Arc<ResponseCache>,
    retry: RetryPolicy,
    queues: Mutex<HashMap<QueueKey, Queue>>,
    inflight: Arc<Mutex<DedupTable>>,
    dedup_key: Box<DedupKeyFn>,
    this: Weak<Self>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<E: BatchExecutor> BatchingEngine<E> {
    pub fn new(config: BatchingConfig, cache: Arc<ResponseCache>, retry: RetryPolicy, executor: E) -> Arc<Self> {
        Self::with_dedup_key(config, cache, retry, executor, Box::new(default_dedup_key))
    }

    pub fn with_dedup_key(
        config: BatchingConfig,
        cache: Arc<ResponseCache>,
        retry: RetryPolicy,
        executor: E,
        dedup_key: Box<DedupKeyFn>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            executor: Arc::new(executor),
            cache,
            retry,
            queues: Mutex::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(DedupTable::default())),
            dedup_key,
            this: this.clone(),
        })
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Start the cache sweeper.
    pub fn start(&self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        self.cache.start_sweeper(shutdown)
    }

    /// Requests waiting in queues.
    pub fn pending(&self) -> usize {
        lock(&self.queues).values().map(|q| q.requests.len()).sum()
    }

    /// Distinct deduplicated requests not yet resolved.
    pub fn in_flight(&self) -> usize {
        lock(&self.inflight).entries.len()
    }

    fn tuning(&self, priority: Priority) -> &PriorityBatch {
        match priority {
            Priority::Low => &self.config.low,
            Priority::Normal => &self.config.normal,
            Priority::High => &self.config.high,
            Priority::Critical => &self.config.critical,
        }
    }

    /// Submit one logical request and wait for its result.
    pub async fn add_request(
        &self,
        method: &str,
        params: Option<Value>,
        server_type: &str,
        options: RequestOptions,
    ) -> Result<Value> {
        if method.trim().is_empty() {
            return Err(OrchestratorError::Validation("method must not be empty".into()));
        }

        if let Some(key) = &options.cache_key {
            if let Some(value) = self.cache.get(key) {
                tracing::trace!(key = %key, "Cache hit");
                return Ok(value);
            }
        }

        let timeout = options
            .timeout
            .unwrap_or(Duration::from_millis(self.config.request_timeout_ms));

        if !self.config.deduplication {
            let rx = self.enqueue(method, params, server_type, &options, None);
            return wait(rx, timeout).await;
        }

        let key = options
            .dedup_key
            .clone()
            .unwrap_or_else(|| (self.dedup_key)(server_type, method, params.as_ref()));
        let shared = {
            let mut table = lock(&self.inflight);
            match table.entries.get(&key) {
                Some(existing) => {
                    metrics::record_dedup_hit();
                    tracing::debug!(key = %key, "Attached to in-flight request");
                    existing.result.clone()
                }
                None => {
                    let id = table.next_id;
                    table.next_id += 1;
                    let rx = self.enqueue(method, params, server_type, &options, Some((key.clone(), id)));
                    let inflight = Arc::clone(&self.inflight);
                    let owned_key = key.clone();
                    let result = async move {
                        let result = wait(rx, timeout).await;
                        release(&inflight, &owned_key, id);
                        result
                    }
                    .boxed()
                    .shared();
                    table.entries.insert(
                        key,
                        InFlight {
                            id,
                            result: result.clone(),
                        },
                    );
                    result
                }
            }
        };
        shared.await
    }

    fn enqueue(
        &self,
        method: &str,
        params: Option<Value>,
        server_type: &str,
        options: &RequestOptions,
        dedup: Option<(String, u64)>,
    ) -> oneshot::Receiver<Result<Value>> {
        let (reply, rx) = oneshot::channel();
        let request = BatchRequest {
            id: Uuid::new_v4().to_string(),
            method: method.to_string(),
            params,
            created_at: Instant::now(),
            cache_key: options.cache_key.clone(),
            cache_ttl: options.cache_ttl,
            dedup,
            reply,
        };

        let priority = options.priority;
        let tuning = self.tuning(priority);
        let limit = tuning.batch_size.min(self.config.max_batch_size).max(1);
        let max_wait = Duration::from_millis(tuning.max_wait_ms);
        let key: QueueKey = (server_type.to_string(), priority);

        let mut queues = lock(&self.queues);
        let queue = queues.entry(key.clone()).or_default();
        queue.requests.push(request);

        if priority == Priority::Critical || max_wait.is_zero() || queue.requests.len() >= limit {
            let batch = queue.drain();
            drop(queues);
            self.spawn_dispatch(key, batch);
        } else {
            // each addition restarts the wait
            queue.generation += 1;
            let generation = queue.generation;
            if let Some(timer) = queue.timer.take() {
                timer.abort();
            }
            let this = self.this.clone();
            queue.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(max_wait).await;
                if let Some(engine) = this.upgrade() {
                    engine.flush_expired(key, generation);
                }
            }));
        }
        rx
    }

    fn flush_expired(&self, key: QueueKey, generation: u64) {
        let mut queues = lock(&self.queues);
        let Some(queue) = queues.get_mut(&key) else {
            return;
        };
        if queue.generation != generation {
            return;
        }
        // this timer is the one running; do not abort it
        queue.timer = None;
        let batch = queue.drain();
        drop(queues);
        if !batch.is_empty() {
            self.spawn_dispatch(key, batch);
        }
    }

    /// Dispatch every queued request now.
    pub fn flush_all(&self) {
        let drained: Vec<(QueueKey, Vec<BatchRequest>)> = lock(&self.queues)
            .iter_mut()
            .map(|(key, queue)| (key.clone(), queue.drain()))
            .filter(|(_, batch)| !batch.is_empty())
            .collect();
        for (key, batch) in drained {
            self.spawn_dispatch(key, batch);
        }
    }

    fn spawn_dispatch(&self, key: QueueKey, batch: Vec<BatchRequest>) {
        let Some(engine) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let (server_type, priority) = key;
            tracing::debug!(
                server_type = %server_type,
                priority = %priority,
                size = batch.len(),
                "Flushing batch"
            );
            engine.dispatch(&server_type, batch).await;
        });
    }

    async fn dispatch(&self, server_type: &str, batch: Vec<BatchRequest>) {
        let mut groups: Vec<(String, Vec<BatchRequest>)> = Vec::new();
        for request in batch {
            match groups.iter_mut().find(|(method, _)| *method == request.method) {
                Some((_, group)) => group.push(request),
                None => groups.push((request.method.clone(), vec![request])),
            }
        }
        join_all(
            groups
                .into_iter()
                .map(|(_, group)| self.dispatch_group(server_type, group)),
        )
        .await;
    }

    async fn dispatch_group(&self, server_type: &str, group: Vec<BatchRequest>) {
        let envelopes: Vec<RpcRequest> = group.iter().map(BatchRequest::envelope).collect();
        let size = group.len();
        let result = self
            .retry
            .run("batch dispatch", |_| {
                self.executor.execute_batch(server_type, envelopes.clone())
            })
            .await;

        match result {
            Ok(responses) => {
                metrics::record_batch("success", size);
                let mut by_id = HashMap::new();
                let mut unmatched = VecDeque::new();
                for response in responses {
                    match response.correlation_key() {
                        Some(id) if group.iter().any(|r| r.id == id) => {
                            by_id.insert(id, response);
                        }
                        _ => unmatched.push_back(response),
                    }
                }
                for request in group {
                    let result = match by_id.remove(&request.id).or_else(|| unmatched.pop_front()) {
                        Some(response) => response.into_result(),
                        None => Err(OrchestratorError::Server(
                            "backend returned no response for this item".into(),
                        )),
                    };
                    self.resolve(request, result);
                }
            }
            Err(e) => {
                metrics::record_batch("failure", size);
                tracing::warn!(
                    server_type = %server_type,
                    size,
                    error = %e,
                    "Batch failed, retrying items individually"
                );
                join_all(group.into_iter().map(|request| async move {
                    let result = self
                        .executor
                        .execute(server_type, request.envelope())
                        .await
                        .and_then(RpcResponse::into_result);
                    self.resolve(request, result);
                }))
                .await;
            }
        }
    }

    fn resolve(&self, request: BatchRequest, result: Result<Value>) {
        if let (Ok(value), Some(key)) = (&result, &request.cache_key) {
            self.cache.set(key.clone(), value.clone(), request.cache_ttl);
        }
        if let Some((key, id)) = &request.dedup {
            release(&self.inflight, key, *id);
        }
        tracing::trace!(
            request = %request.id,
            waited = ?request.created_at.elapsed(),
            ok = result.is_ok(),
            "Batched request resolved"
        );
        let _ = request.reply.send(result);
    }
}

/// Forget a dedup entry, unless a newer request already took the key.
fn release(table: &Mutex<DedupTable>, key: &str, id: u64) {
    let mut table = lock(table);
    if table.entries.get(key).is_some_and(|entry| entry.id == id) {
        table.entries.remove(key);
    }
}

async fn wait(rx: oneshot::Receiver<Result<Value>>, timeout: Duration) -> Result<Value> {
    match tokio::time::timeout(timeout, rx).await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(OrchestratorError::Server(
            "batched request dropped before dispatch".into(),
        )),
        Err(_) => Err(OrchestratorError::Timeout(format!(
            "batched request after {:?}",
            timeout
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, RetryConfig};
    use crate::protocol::RpcError;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockExecutor {
        batches: Mutex<Vec<Vec<String>>>,
        singles: AtomicUsize,
        fail_batches: AtomicBool,
        fail_singles: AtomicBool,
        delay: Duration,
    }

    impl MockExecutor {
        fn reply(request: &RpcRequest) -> RpcResponse {
            if request.method == "bad" {
                return RpcResponse::failure(
                    request.id.clone(),
                    RpcError {
                        code: -32602,
                        message: "invalid params".into(),
                        data: None,
                    },
                );
            }
            RpcResponse::success(
                request.id.clone(),
                json!({"method": request.method, "params": request.params}),
            )
        }

        fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().iter().map(Vec::len).collect()
        }
    }

    impl BatchExecutor for Arc<MockExecutor> {
        fn execute_batch<'a>(
            &'a self,
            _server_type: &'a str,
            requests: Vec<RpcRequest>,
        ) -> BoxFuture<'a, Result<Vec<RpcResponse>>> {
            Box::pin(async move {
                self.batches
                    .lock()
                    .unwrap()
                    .push(requests.iter().map(|r| r.method.clone()).collect());
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                if self.fail_batches.load(Ordering::SeqCst) {
                    return Err(OrchestratorError::Server("batch rejected".into()));
                }
                // reversed on purpose: matching is by id
                Ok(requests.iter().rev().map(MockExecutor::reply).collect())
            })
        }

        fn execute<'a>(&'a self, _server_type: &'a str, request: RpcRequest) -> BoxFuture<'a, Result<RpcResponse>> {
            Box::pin(async move {
                self.singles.fetch_add(1, Ordering::SeqCst);
                if self.fail_singles.load(Ordering::SeqCst) {
                    return Err(OrchestratorError::Server("single rejected".into()));
                }
                Ok(MockExecutor::reply(&request))
            })
        }
    }

    fn engine(mock: &Arc<MockExecutor>) -> Arc<BatchingEngine<Arc<MockExecutor>>> {
        BatchingEngine::new(
            BatchingConfig::default(),
            Arc::new(ResponseCache::new(CacheConfig::default())),
            RetryPolicy::new(RetryConfig::default()),
            Arc::clone(mock),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn identical_requests_share_one_dispatch() {
        let mock = Arc::new(MockExecutor::default());
        let engine = engine(&mock);

        let (a, b) = tokio::join!(
            engine.add_request("search", Some(json!({"q": "rust"})), "web", RequestOptions::default()),
            engine.add_request("search", Some(json!({"q": "rust"})), "web", RequestOptions::default()),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(mock.batch_sizes(), vec![1]);
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn critical_dispatches_without_waiting() {
        let mock = Arc::new(MockExecutor::default());
        let engine = engine(&mock);

        let started = Instant::now();
        engine
            .add_request("ping", None, "web", RequestOptions::with_priority(Priority::Critical))
            .await
            .unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);

        let started = Instant::now();
        engine
            .add_request("ping", None, "web", RequestOptions::with_priority(Priority::Normal))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_and_groups_by_method() {
        let mock = Arc::new(MockExecutor::default());
        let engine = engine(&mock);
        let high = || RequestOptions::with_priority(Priority::High);

        let started = Instant::now();
        let results = join_all((0..5).map(|i| {
            let method = if i % 2 == 0 { "read" } else { "stat" };
            engine.add_request(method, Some(json!({"n": i})), "files", high())
        }))
        .await;
        assert_eq!(started.elapsed(), Duration::ZERO);

        let mut sizes = mock.batch_sizes();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 3]);
        for (i, result) in results.into_iter().enumerate() {
            let value = result.unwrap();
            assert_eq!(value["params"]["n"], json!(i));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_batch_falls_back_to_individual_calls() {
        let mock = Arc::new(MockExecutor::default());
        mock.fail_batches.store(true, Ordering::SeqCst);
        let engine = engine(&mock);

        let results = join_all((0..3).map(|i| {
            engine.add_request("read", Some(json!({"n": i})), "files", RequestOptions::default())
        }))
        .await;
        assert!(results.iter().all(Result::is_ok));
        assert_eq!(mock.batch_sizes(), vec![3]);
        assert_eq!(mock.singles.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_failure_reaches_every_waiter() {
        let mock = Arc::new(MockExecutor::default());
        mock.fail_batches.store(true, Ordering::SeqCst);
        mock.fail_singles.store(true, Ordering::SeqCst);
        let engine = engine(&mock);

        let (a, b) = tokio::join!(
            engine.add_request("read", None, "files", RequestOptions::default()),
            engine.add_request("read", None, "files", RequestOptions::default()),
        );
        let expected = OrchestratorError::Server("single rejected".into());
        assert_eq!(a.unwrap_err(), expected);
        assert_eq!(b.unwrap_err(), expected);
        assert_eq!(mock.singles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cached_results_skip_the_backend() {
        let mock = Arc::new(MockExecutor::default());
        let engine = engine(&mock);
        let options = RequestOptions::default().cached("tools");

        let first = engine.add_request("tools/list", None, "web", options.clone()).await.unwrap();
        let second = engine.add_request("tools/list", None, "web", options).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(mock.batch_sizes().len(), 1);
        assert_eq!(engine.cache().stats().hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn item_errors_are_rejected_individually() {
        let mock = Arc::new(MockExecutor::default());
        let engine = engine(&mock);

        let (good, bad) = tokio::join!(
            engine.add_request("ok", None, "web", RequestOptions::default()),
            engine.add_request("bad", None, "web", RequestOptions::default()),
        );
        assert!(good.is_ok());
        assert!(matches!(bad, Err(OrchestratorError::Rpc { code: -32602, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_waiters() {
        let mock = Arc::new(MockExecutor {
            delay: Duration::from_secs(10),
            ..MockExecutor::default()
        });
        let engine = engine(&mock);
        let options = RequestOptions {
            timeout: Some(Duration::from_millis(200)),
            ..RequestOptions::default()
        };

        let err = engine.add_request("read", None, "files", options).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));
        assert_eq!(engine.in_flight(), 0);
    }

    #[tokio::test]
    async fn empty_method_is_rejected() {
        let mock = Arc::new(MockExecutor::default());
        let engine = engine(&mock);
        let err = engine.add_request(" ", None, "web", RequestOptions::default()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(engine.pending(), 0);
    }
}
