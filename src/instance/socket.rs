//! Persistent WebSocket servers.
//!
//! One long-lived connection carries every call. A writer task drains an
//! outbound queue and a reader task resolves pending calls by id.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::SocketSpec;
use crate::error::{OrchestratorError, Result};
use crate::instance::Liveness;
use crate::protocol::{PendingCalls, RpcRequest, RpcResponse};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

struct SocketRuntime {
    outbound: mpsc::Sender<Message>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct SocketDriver {
    id: String,
    spec: SocketSpec,
    pending: Arc<PendingCalls>,
    connected: Arc<AtomicBool>,
    stopping: Arc<AtomicBool>,
    liveness: Liveness,
    runtime: Mutex<Option<SocketRuntime>>,
}

impl SocketDriver {
    pub fn new(id: &str, spec: SocketSpec, liveness: Liveness) -> Self {
        Self {
            id: id.to_string(),
            spec,
            pending: Arc::new(PendingCalls::new()),
            connected: Arc::new(AtomicBool::new(false)),
            stopping: Arc::new(AtomicBool::new(false)),
            liveness,
            runtime: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut slot = self.runtime.lock().await;
        if slot.is_some() && self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(old) = slot.take() {
            for task in old.tasks {
                task.abort();
            }
        }

        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(self.spec.url.as_str()))
            .await
            .map_err(|_| OrchestratorError::Server(format!("connect to {} timed out", self.spec.url)))?
            .map_err(|e| OrchestratorError::Server(format!("connect to {} failed: {}", self.spec.url, e)))?;
        tracing::debug!(server = %self.id, url = %self.spec.url, "Socket connected");

        let (mut sink, mut stream) = ws.split();
        let (outbound, mut queue) = mpsc::channel::<Message>(256);
        self.connected.store(true, Ordering::SeqCst);
        self.stopping.store(false, Ordering::SeqCst);

        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let pending = Arc::clone(&self.pending);
            let connected = Arc::clone(&self.connected);
            let stopping = Arc::clone(&self.stopping);
            let liveness = self.liveness.clone();
            let id = self.id.clone();
            tokio::spawn(async move {
                while let Some(frame) = stream.next().await {
                    match frame {
                        Ok(Message::Text(text)) => {
                            pending.complete_frame(text.as_str().as_bytes());
                        }
                        Ok(Message::Binary(data)) => {
                            pending.complete_frame(&data);
                        }
                        Ok(Message::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(server = %id, error = %e, "Socket read failed");
                            break;
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                let failed = pending.fail_all();
                tracing::debug!(server = %id, failed, "Socket closed");
                liveness.exited(None, stopping.load(Ordering::SeqCst));
            })
        };

        *slot = Some(SocketRuntime {
            outbound,
            tasks: vec![writer, reader],
        });
        Ok(())
    }

    pub async fn call(&self, mut request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        let outbound = {
            let slot = self.runtime.lock().await;
            slot.as_ref()
                .filter(|_| self.connected.load(Ordering::SeqCst))
                .map(|rt| rt.outbound.clone())
                .ok_or_else(|| OrchestratorError::Network(format!("socket to {} is not connected", self.id)))?
        };

        let (key, original) = request.tag();
        let text = serde_json::to_string(&request)
            .map_err(|e| OrchestratorError::Validation(format!("unserializable request: {}", e)))?;
        let rx = self.pending.register(key.clone());
        if outbound.send(Message::Text(text.into())).await.is_err() {
            self.pending.cancel(&key);
            return Err(OrchestratorError::Network(format!("socket to {} closed", self.id)));
        }

        let deadline = timeout.min(Duration::from_millis(self.spec.call_timeout_ms));
        let mut response = self.pending.wait(&key, rx, deadline).await?;
        response.id = original;
        Ok(response)
    }

    /// Items are multiplexed over the connection and resolved independently.
    pub async fn call_batch(&self, requests: Vec<RpcRequest>, timeout: Duration) -> Result<Vec<RpcResponse>> {
        try_join_all(requests.into_iter().map(|r| self.call(r, timeout))).await
    }

    pub async fn probe(&self, _timeout: Duration) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let slot = self.runtime.lock().await;
        match slot.as_ref() {
            Some(rt) => rt.outbound.send(Message::Ping(Vec::new().into())).await.is_ok(),
            None => false,
        }
    }

    pub async fn stop(&self) -> Result<()> {
        let Some(rt) = self.runtime.lock().await.take() else {
            return Ok(());
        };
        self.stopping.store(true, Ordering::SeqCst);
        let _ = rt.outbound.send(Message::Close(None)).await;
        drop(rt.outbound);

        let mut tasks = rt.tasks.into_iter();
        if let Some(writer) = tasks.next() {
            let _ = tokio::time::timeout(Duration::from_secs(1), writer).await;
        }
        for task in tasks {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.pending.fail_all();
        Ok(())
    }
}
