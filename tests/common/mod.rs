//! Shared utilities for integration tests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

use mcp_orchestrator::config::{Deployment, OrchestratorConfig, ServerConfig};

/// What the mock backend does with its n-th request (0-based).
#[allow(dead_code)]
#[derive(Debug, Clone, Copy)]
pub enum Reply {
    Echo,
    Status(u16),
    Delay(Duration),
}

struct MockState {
    calls: AtomicU32,
    items: AtomicU32,
    behavior: Box<dyn Fn(u32) -> Reply + Send + Sync>,
}

/// A JSON-RPC backend on a random local port.
pub struct MockBackend {
    pub url: String,
    state: Arc<MockState>,
}

#[allow(dead_code)]
impl MockBackend {
    /// HTTP requests received, a batch counting once.
    pub fn calls(&self) -> u32 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Envelopes received across all requests.
    pub fn items(&self) -> u32 {
        self.state.items.load(Ordering::SeqCst)
    }
}

fn echo_one(request: &Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "result": {"method": request["method"], "params": request["params"]},
    })
}

async fn handle(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let n = state.calls.fetch_add(1, Ordering::SeqCst);
    let items = body.as_array().map_or(1, Vec::len) as u32;
    state.items.fetch_add(items, Ordering::SeqCst);

    match (state.behavior)(n) {
        Reply::Status(code) => {
            return StatusCode::from_u16(code)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
        Reply::Delay(delay) => tokio::time::sleep(delay).await,
        Reply::Echo => {}
    }
    let reply = match &body {
        Value::Array(requests) => Value::Array(requests.iter().map(echo_one).collect()),
        request => echo_one(request),
    };
    Json(reply).into_response()
}

/// Start a backend whose reply to each request is chosen by `behavior`.
pub async fn start_backend<F>(behavior: F) -> MockBackend
where
    F: Fn(u32) -> Reply + Send + Sync + 'static,
{
    let state = Arc::new(MockState {
        calls: AtomicU32::new(0),
        items: AtomicU32::new(0),
        behavior: Box::new(behavior),
    });
    let app = Router::new().route("/rpc", post(handle)).with_state(Arc::clone(&state));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    MockBackend {
        url: format!("http://{}/rpc", addr),
        state,
    }
}

/// A long-running child that serves its calls through `endpoint`.
pub fn http_server(id: &str, server_type: &str, endpoint: &str) -> ServerConfig {
    let mut config = ServerConfig::subprocess(id, "sleep", vec!["30".into()]);
    config.server_type = server_type.to_string();
    if let Deployment::Subprocess(spec) = &mut config.deployment {
        spec.endpoint = Some(endpoint.to_string());
        spec.settle_ms = 50;
        spec.shutdown_grace_secs = 1;
    }
    config.request_timeout_ms = Some(2_000);
    config
}

/// Defaults with periodic probes and metrics export off.
pub fn quiet_config(servers: Vec<ServerConfig>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.servers = servers;
    config.health_check.enabled = false;
    config.observability.metrics_enabled = false;
    config
}
