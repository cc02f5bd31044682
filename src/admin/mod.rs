//! Admin HTTP API.
//!
//! # Routes
//! ```text
//! GET    /admin/status
//! GET    /admin/servers            POST /admin/servers (ServerConfig)
//! DELETE /admin/servers/{id}
//! GET    /admin/servers/{id}/metrics
//! GET    /admin/metrics
//! GET    /admin/pools
//! GET    /admin/cache
//! POST   /rpc                      POST /rpc/{server_type}
//! ```
//!
//! Every route requires the configured bearer key.

pub mod auth;
pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::batching::{BatchingEngine, OrchestratorExecutor};
use crate::orchestrator::Orchestrator;

use self::auth::admin_auth_middleware;
use self::handlers::*;

/// Server type used for untyped batches.
pub const DEFAULT_SERVER_TYPE: &str = "default";

#[derive(Clone)]
pub struct AdminState {
    pub orchestrator: Arc<Orchestrator>,
    pub engine: Arc<BatchingEngine<OrchestratorExecutor>>,
    pub api_key: Arc<str>,
}

pub fn setup_admin_router(state: AdminState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/servers", get(get_servers).post(register_server))
        .route("/admin/servers/{id}", delete(unregister_server))
        .route("/admin/servers/{id}/metrics", get(get_server_metrics))
        .route("/admin/metrics", get(get_metrics))
        .route("/admin/pools", get(get_pools))
        .route("/admin/cache", get(get_cache))
        .route("/rpc", post(route_rpc))
        .route("/rpc/{server_type}", post(route_rpc_to))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the admin API until `shutdown` resolves.
pub async fn serve(
    router: Router,
    listener: TcpListener,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    tracing::info!(address = %listener.local_addr()?, "Admin API listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}
