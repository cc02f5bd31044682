//! JSON-RPC over HTTP through a pooled connection.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{OrchestratorError, Result};
use crate::pool::{AcquireOptions, ConnectionPoolManager, Endpoint, Protocol, Transport};
use crate::protocol::{RpcRequest, RpcResponse};

/// Posts envelopes to one backend URL using connections from a named pool.
pub struct HttpRpcClient {
    pools: Arc<ConnectionPoolManager>,
    pool_name: String,
    endpoint: Endpoint,
}

impl HttpRpcClient {
    pub fn new(pools: Arc<ConnectionPoolManager>, server_id: &str, url: impl Into<String>) -> Self {
        Self {
            pools,
            pool_name: format!("{}-http", server_id),
            endpoint: Endpoint::new(url, Protocol::Http),
        }
    }

    pub fn url(&self) -> &str {
        &self.endpoint.url
    }

    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// Create the backing pool. Safe to call again after a restart.
    pub fn open(&self) -> Result<()> {
        self.pools.create_pool(&self.pool_name, self.endpoint.clone(), None)?;
        Ok(())
    }

    pub fn close(&self) {
        self.pools.remove_pool(&self.pool_name);
    }

    async fn post<B, R>(&self, body: &B, timeout: Duration) -> Result<R>
    where
        B: Serialize,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(body)
            .map_err(|e| OrchestratorError::Validation(format!("unserializable request: {}", e)))?;
        let sent = payload.len() as u64;

        // Released on drop, so a cancelled call still gives its connection back.
        let mut conn = self.pools.checkout(&self.pool_name, AcquireOptions::default()).await?;

        let result = match conn.get() {
            Transport::Http(http) => {
                let exchange = async {
                    let response = http
                        .client
                        .post(http.url.clone())
                        .header(CONTENT_TYPE, "application/json")
                        .timeout(timeout)
                        .body(payload)
                        .send()
                        .await?;
                    let status = response.status();
                    let bytes = response.bytes().await?;
                    if !status.is_success() {
                        return Err(OrchestratorError::Server(format!(
                            "{} answered HTTP {}",
                            http.url, status
                        )));
                    }
                    let parsed = serde_json::from_slice::<R>(&bytes).map_err(|e| {
                        OrchestratorError::Validation(format!("malformed backend response: {}", e))
                    })?;
                    Ok::<_, OrchestratorError>((parsed, bytes.len() as u64))
                };
                exchange.await
            }
            other => Err(OrchestratorError::Configuration(format!(
                "pool {} returned a {} connection for an HTTP backend",
                self.pool_name,
                other.protocol()
            ))),
        };

        match result {
            Ok((parsed, received)) => {
                conn.record_transfer(sent, received);
                Ok(parsed)
            }
            Err(e) => {
                conn.record_error();
                if matches!(e, OrchestratorError::Network(_)) {
                    conn.mark_unhealthy();
                }
                Err(e)
            }
        }
    }

    pub async fn call(&self, mut request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        let (_, original) = request.tag();
        let mut response: RpcResponse = self.post(&request, timeout).await?;
        response.id = original;
        Ok(response)
    }

    /// Post a JSON array and match responses back to request order by id.
    pub async fn call_batch(&self, mut requests: Vec<RpcRequest>, timeout: Duration) -> Result<Vec<RpcResponse>> {
        let tags: Vec<(String, Option<serde_json::Value>)> = requests.iter_mut().map(RpcRequest::tag).collect();
        let responses: Vec<RpcResponse> = self.post(&requests, timeout).await?;
        Ok(reorder(tags, responses))
    }

    /// Any well-formed envelope, even an error, proves the backend is serving.
    pub async fn probe(&self, timeout: Duration) -> bool {
        self.call(RpcRequest::new("ping", None), timeout).await.is_ok()
    }
}

/// Put responses back in request order and restore caller ids. Responses
/// without a matching id fill the remaining slots in arrival order.
pub(crate) fn reorder(
    tags: Vec<(String, Option<serde_json::Value>)>,
    responses: Vec<RpcResponse>,
) -> Vec<RpcResponse> {
    let mut slots: Vec<Option<RpcResponse>> = vec![None; tags.len()];
    let mut unmatched = Vec::new();
    for response in responses {
        let position = response
            .correlation_key()
            .and_then(|key| tags.iter().position(|(tag, _)| *tag == key));
        match position {
            Some(i) if slots[i].is_none() => slots[i] = Some(response),
            _ => unmatched.push(response),
        }
    }
    let mut unmatched = unmatched.into_iter();
    slots
        .into_iter()
        .zip(tags)
        .map(|(slot, (_, original))| {
            let mut response = slot.or_else(|| unmatched.next()).unwrap_or_else(|| {
                RpcResponse::failure(
                    None,
                    OrchestratorError::Server("backend returned no response for this item".into()).to_rpc_error(),
                )
            });
            response.id = original;
            response
        })
        .collect()
}
