//! Where dispatched batches go.

use std::sync::Arc;

use futures_util::future::BoxFuture;

use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::protocol::{RpcRequest, RpcResponse};

/// Backend transport used by the batching engine.
pub trait BatchExecutor: Send + Sync + 'static {
    /// One call carrying every request; responses in request order.
    fn execute_batch<'a>(&'a self, server_type: &'a str, requests: Vec<RpcRequest>) -> BoxFuture<'a, Result<Vec<RpcResponse>>>;

    /// Single request, used as the fallback after a failed batch.
    fn execute<'a>(&'a self, server_type: &'a str, request: RpcRequest) -> BoxFuture<'a, Result<RpcResponse>>;
}

/// Sends batches through the orchestrator's routing and breaker guard.
#[derive(Clone)]
pub struct OrchestratorExecutor {
    orchestrator: Arc<Orchestrator>,
}

impl OrchestratorExecutor {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

impl BatchExecutor for OrchestratorExecutor {
    fn execute_batch<'a>(&'a self, server_type: &'a str, requests: Vec<RpcRequest>) -> BoxFuture<'a, Result<Vec<RpcResponse>>> {
        Box::pin(self.orchestrator.route_batch(server_type, requests))
    }

    fn execute<'a>(&'a self, server_type: &'a str, request: RpcRequest) -> BoxFuture<'a, Result<RpcResponse>> {
        Box::pin(self.orchestrator.route_request_to(server_type, request))
    }
}
