use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::admin::AdminState;
use crate::batching::CacheStats;
use crate::config::ServerConfig;
use crate::error::OrchestratorError;
use crate::instance::InstanceReport;
use crate::orchestrator::ServerMetrics;
use crate::pool::PoolStats;
use crate::protocol::{RpcRequest, RpcResponse};

/// Orchestrator errors as HTTP responses.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::Validation(_) | OrchestratorError::Configuration(_) => StatusCode::BAD_REQUEST,
            OrchestratorError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::Server(_) | OrchestratorError::Network(_) | OrchestratorError::Rpc { .. } => {
                StatusCode::BAD_GATEWAY
            }
        };
        (status, Json(json!({ "error": self.0.to_rpc_error() }))).into_response()
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub servers: usize,
    pub healthy_servers: usize,
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    let servers = state.orchestrator.get_server_list();
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        servers: servers.len(),
        healthy_servers: servers.iter().filter(|s| s.healthy).count(),
    })
}

pub async fn get_servers(State(state): State<AdminState>) -> Json<Vec<InstanceReport>> {
    Json(state.orchestrator.get_server_list())
}

pub async fn register_server(
    State(state): State<AdminState>,
    Json(config): Json<ServerConfig>,
) -> Result<(StatusCode, Json<InstanceReport>), ApiError> {
    let instance = state.orchestrator.register_server(config).await?;
    Ok((StatusCode::CREATED, Json(instance.get_status())))
}

pub async fn unregister_server(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.unregister_server(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn get_server_metrics(
    State(state): State<AdminState>,
    Path(id): Path<String>,
) -> Result<Json<ServerMetrics>, ApiError> {
    let mut metrics = state.orchestrator.get_server_metrics(Some(&id))?;
    metrics
        .pop()
        .map(Json)
        .ok_or_else(|| OrchestratorError::NotFound(format!("server '{}'", id)).into())
}

pub async fn get_metrics(State(state): State<AdminState>) -> Result<Json<Vec<ServerMetrics>>, ApiError> {
    Ok(Json(state.orchestrator.get_server_metrics(None)?))
}

pub async fn get_pools(State(state): State<AdminState>) -> Json<Vec<PoolStats>> {
    Json(state.orchestrator.context().pools.stats())
}

pub async fn get_cache(State(state): State<AdminState>) -> Json<CacheStats> {
    Json(state.engine.cache().stats())
}

/// One envelope or a JSON-RPC batch.
#[derive(Deserialize)]
#[serde(untagged)]
pub enum RpcPayload {
    Batch(Vec<RpcRequest>),
    Single(RpcRequest),
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum RpcReply {
    Batch(Vec<RpcResponse>),
    Single(RpcResponse),
}

pub async fn route_rpc(State(state): State<AdminState>, Json(payload): Json<RpcPayload>) -> Json<RpcReply> {
    Json(dispatch(&state, None, payload).await)
}

pub async fn route_rpc_to(
    State(state): State<AdminState>,
    Path(server_type): Path<String>,
    Json(payload): Json<RpcPayload>,
) -> Json<RpcReply> {
    Json(dispatch(&state, Some(&server_type), payload).await)
}

/// Routing failures become error envelopes so callers always get JSON-RPC back.
async fn dispatch(state: &AdminState, server_type: Option<&str>, payload: RpcPayload) -> RpcReply {
    match payload {
        RpcPayload::Single(request) => {
            let id = request.id.clone();
            let result = match server_type {
                Some(t) => state.orchestrator.route_request_to(t, request).await,
                None => state.orchestrator.route_request(request).await,
            };
            RpcReply::Single(result.unwrap_or_else(|e| RpcResponse::failure(id, e.to_rpc_error())))
        }
        RpcPayload::Batch(requests) => {
            let ids: Vec<_> = requests.iter().map(|r| r.id.clone()).collect();
            let server_type = server_type.unwrap_or(crate::admin::DEFAULT_SERVER_TYPE);
            match state.orchestrator.route_batch(server_type, requests).await {
                Ok(responses) => RpcReply::Batch(responses),
                Err(e) => {
                    let error = e.to_rpc_error();
                    RpcReply::Batch(
                        ids.into_iter()
                            .map(|id| RpcResponse::failure(id, error.clone()))
                            .collect(),
                    )
                }
            }
        }
    }
}
