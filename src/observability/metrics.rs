//! Metrics collection and exposition.
//!
//! # Metrics
//! - `mcp_requests_total` (counter): routed requests by server, outcome
//! - `mcp_request_duration_seconds` (histogram): latency per server
//! - `mcp_server_healthy` (gauge): 1=healthy, 0=unhealthy
//! - `mcp_circuit_state` (gauge): 0=closed, 1=open, 2=half-open
//! - `mcp_pool_size` (gauge): connections per pool and state
//! - `mcp_cache_hit_rate` (gauge): response cache hit ratio
//!
//! # Design Decisions
//! - Low-overhead metric updates through the `metrics` facade
//! - Labels for server, pool, outcome

use std::net::SocketAddr;
use tokio::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

use crate::resilience::CircuitState;

/// Initialize the Prometheus exporter.
pub fn init_metrics(addr: SocketAddr) {
    let builder = PrometheusBuilder::new().with_http_listener(addr);

    if let Err(e) = builder.install() {
        tracing::error!("Failed to install Prometheus recorder: {}", e);
    } else {
        tracing::info!(address = %addr, "Metrics exporter listening");
    }
}

pub fn record_request(server: &str, outcome: &str, started: Instant) {
    ::metrics::counter!(
        "mcp_requests_total",
        "server" => server.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    ::metrics::histogram!("mcp_request_duration_seconds", "server" => server.to_string())
        .record(started.elapsed().as_secs_f64());
}

pub fn record_server_health(server: &str, healthy: bool) {
    ::metrics::gauge!("mcp_server_healthy", "server" => server.to_string())
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_circuit_state(server: &str, state: CircuitState) {
    ::metrics::gauge!("mcp_circuit_state", "server" => server.to_string()).set(state.as_gauge());
}

pub fn record_circuit_rejection(server: &str) {
    ::metrics::counter!("mcp_circuit_rejections_total", "server" => server.to_string())
        .increment(1);
}

pub fn record_recovery_attempt(server: &str, outcome: &str) {
    ::metrics::counter!(
        "mcp_recovery_attempts_total",
        "server" => server.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

pub fn record_pool_connection_created(pool: &str) {
    ::metrics::counter!("mcp_pool_connections_created_total", "pool" => pool.to_string())
        .increment(1);
}

pub fn record_pool_connection_destroyed(pool: &str, reason: &str) {
    ::metrics::counter!(
        "mcp_pool_connections_destroyed_total",
        "pool" => pool.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_pool_acquire_timeout(pool: &str) {
    ::metrics::counter!("mcp_pool_acquire_timeouts_total", "pool" => pool.to_string())
        .increment(1);
}

pub fn record_pool_size(pool: &str, idle: usize, active: usize, waiters: usize) {
    ::metrics::gauge!("mcp_pool_size", "pool" => pool.to_string(), "state" => "idle")
        .set(idle as f64);
    ::metrics::gauge!("mcp_pool_size", "pool" => pool.to_string(), "state" => "active")
        .set(active as f64);
    ::metrics::gauge!("mcp_pool_waiters", "pool" => pool.to_string()).set(waiters as f64);
}

pub fn record_cache_lookup(hit: bool) {
    ::metrics::counter!("mcp_cache_requests_total", "result" => if hit { "hit" } else { "miss" })
        .increment(1);
}

pub fn record_cache_eviction(reason: &str) {
    ::metrics::counter!("mcp_cache_evictions_total", "reason" => reason.to_string()).increment(1);
}

pub fn record_cache_usage(entries: usize, bytes: usize, hit_rate: f64) {
    ::metrics::gauge!("mcp_cache_entries").set(entries as f64);
    ::metrics::gauge!("mcp_cache_bytes").set(bytes as f64);
    ::metrics::gauge!("mcp_cache_hit_rate").set(hit_rate);
}

pub fn record_batch(outcome: &str, size: usize) {
    ::metrics::counter!("mcp_batches_dispatched_total", "outcome" => outcome.to_string())
        .increment(1);
    ::metrics::histogram!("mcp_batch_size").record(size as f64);
}

pub fn record_dedup_hit() {
    ::metrics::counter!("mcp_dedup_hits_total").increment(1);
}
