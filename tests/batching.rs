//! Batching engine against a real HTTP backend.
#![cfg(unix)]

use std::time::Duration;

use futures_util::future::join_all;
use serde_json::json;

use mcp_orchestrator::lifecycle::Runtime;
use mcp_orchestrator::{Priority, RequestOptions};

mod common;
use common::{http_server, quiet_config, start_backend, Reply};

#[tokio::test]
async fn concurrent_requests_share_batches() {
    let backend = start_backend(|_| Reply::Echo).await;
    let runtime = Runtime::start(quiet_config(vec![http_server("a", "search", &backend.url)]))
        .await
        .unwrap();

    let calls = (0..20).map(|i| {
        runtime
            .engine
            .add_request("query", Some(json!({"n": i})), "search", RequestOptions::default())
    });
    let results = join_all(calls).await;

    for (i, result) in results.into_iter().enumerate() {
        let value = result.unwrap();
        assert_eq!(value["method"], "query");
        assert_eq!(value["params"]["n"], i);
    }
    assert_eq!(backend.items(), 20);
    assert!(backend.calls() <= 2, "20 requests took {} round trips", backend.calls());
    runtime.stop().await;
}

#[tokio::test]
async fn identical_requests_are_sent_once() {
    let backend = start_backend(|_| Reply::Delay(Duration::from_millis(100))).await;
    let runtime = Runtime::start(quiet_config(vec![http_server("a", "search", &backend.url)]))
        .await
        .unwrap();

    let calls = (0..5).map(|_| {
        runtime.engine.add_request(
            "query",
            Some(json!({"q": "same"})),
            "search",
            RequestOptions::with_priority(Priority::Critical),
        )
    });
    for result in join_all(calls).await {
        assert_eq!(result.unwrap()["params"]["q"], "same");
    }
    assert_eq!(backend.items(), 1);
    runtime.stop().await;
}

#[tokio::test]
async fn cached_response_skips_the_backend() {
    let backend = start_backend(|_| Reply::Echo).await;
    let runtime = Runtime::start(quiet_config(vec![http_server("a", "search", &backend.url)]))
        .await
        .unwrap();

    let options = || RequestOptions::default().cached("tools");
    let first = runtime
        .engine
        .add_request("tools/list", None, "search", options())
        .await
        .unwrap();
    let second = runtime
        .engine
        .add_request("tools/list", None, "search", options())
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(backend.items(), 1);
    assert_eq!(runtime.engine.cache().stats().hits, 1);
    runtime.stop().await;
}

#[tokio::test]
async fn pool_never_exceeds_its_maximum() {
    let backend = start_backend(|_| Reply::Delay(Duration::from_millis(50))).await;
    let mut config = quiet_config(vec![http_server("a", "search", &backend.url)]);
    config.pool.max_connections = 5;
    let runtime = Runtime::start(config).await.unwrap();

    let calls = (0..20).map(|i| {
        runtime.engine.add_request(
            "query",
            Some(json!({"n": i})),
            "search",
            RequestOptions::with_priority(Priority::Critical),
        )
    });
    let results = join_all(calls).await;
    assert!(results.iter().all(Result::is_ok));

    let stats = runtime.orchestrator.context().pools.stats();
    let pool = stats.iter().find(|s| s.name == "a-http").unwrap();
    assert!(pool.total <= 5);
    assert_eq!(pool.max_connections, 5);
    assert_eq!(backend.items(), 20);
    runtime.stop().await;
}
