//! Matching inbound responses to outstanding calls.
//!
//! Used by the multiplexed transports (stdio, socket) where many calls share
//! one stream and responses arrive in any order.

use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{OrchestratorError, Result};
use crate::protocol::envelope::RpcResponse;

/// Table of in-flight calls keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: DashMap<String, oneshot::Sender<RpcResponse>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call before its request is written.
    pub fn register(&self, key: String) -> oneshot::Receiver<RpcResponse> {
        let (tx, rx) = oneshot::channel();
        self.calls.insert(key, tx);
        rx
    }

    /// Deliver a response to its waiter. Returns false for unknown ids.
    pub fn complete(&self, response: RpcResponse) -> bool {
        let Some(key) = response.correlation_key() else {
            return false;
        };
        match self.calls.remove(&key) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => false,
        }
    }

    /// Deliver one inbound frame, either a single response or a batch.
    /// Returns how many waiters were completed.
    pub fn complete_frame(&self, frame: &[u8]) -> usize {
        if let Ok(batch) = serde_json::from_slice::<Vec<RpcResponse>>(frame) {
            return batch.into_iter().map(|r| self.complete(r)).filter(|done| *done).count();
        }
        match serde_json::from_slice::<RpcResponse>(frame) {
            Ok(response) => usize::from(self.complete(response)),
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring frame that is not a response");
                0
            }
        }
    }

    pub fn cancel(&self, key: &str) {
        self.calls.remove(key);
    }

    /// Drop every waiter; they observe a closed connection.
    pub fn fail_all(&self) -> usize {
        let count = self.calls.len();
        self.calls.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Await a registered call, removing it from the table on timeout.
    pub async fn wait(
        &self,
        key: &str,
        rx: oneshot::Receiver<RpcResponse>,
        timeout: Duration,
    ) -> Result<RpcResponse> {
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(OrchestratorError::Network(
                "connection closed before response".into(),
            )),
            Err(_) => {
                self.cancel(key);
                Err(OrchestratorError::Timeout(format!(
                    "no response for call {} within {:?}",
                    key, timeout
                )))
            }
        }
    }
}
