//! Request batching engine and response cache.
//!
//! Sits above the orchestrator: callers submit single logical requests, the
//! engine serves cache hits, collapses duplicates and sends the rest as
//! per-method batches through a `BatchExecutor`.

pub mod cache;
pub mod engine;
pub mod executor;

pub use cache::{CacheStats, ResponseCache};
pub use engine::{BatchingEngine, DedupKeyFn, RequestOptions};
pub use executor::{BatchExecutor, OrchestratorExecutor};
