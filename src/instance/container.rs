//! Container-backed servers driven through the runtime CLI.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::Mutex;

use crate::config::{ContainerSpec, ResourceLimits, ServerConfig};
use crate::error::{OrchestratorError, Result};
use crate::instance::http::HttpRpcClient;
use crate::instance::InstanceContext;
use crate::protocol::{RpcRequest, RpcResponse};

const READY_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct ContainerDriver {
    spec: ContainerSpec,
    name: String,
    env: BTreeMap<String, String>,
    resources: ResourceLimits,
    http: HttpRpcClient,
    container_id: Mutex<Option<String>>,
}

/// Arguments for `<runtime> run`, publishing the port on the same host port.
pub(crate) fn run_args(
    name: &str,
    spec: &ContainerSpec,
    env: &BTreeMap<String, String>,
    resources: &ResourceLimits,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        name.to_string(),
        "-p".to_string(),
        format!("{}:{}", spec.port, spec.port),
    ];
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(memory) = &resources.memory {
        args.push("--memory".to_string());
        args.push(memory.clone());
    }
    if let Some(cpus) = resources.cpus {
        args.push("--cpus".to_string());
        args.push(cpus.to_string());
    }
    args.push(spec.image.clone());
    args.extend(spec.args.iter().cloned());
    args
}

impl ContainerDriver {
    pub fn new(config: &ServerConfig, spec: ContainerSpec, ctx: &InstanceContext) -> Self {
        let url = format!("http://127.0.0.1:{}{}", spec.port, spec.path);
        Self {
            name: format!("mcp-{}", config.id),
            env: config.env.clone(),
            resources: config.resources.clone(),
            http: HttpRpcClient::new(Arc::clone(&ctx.pools), &config.id, url),
            container_id: Mutex::new(None),
            spec,
        }
    }

    async fn runtime(&self, args: &[String]) -> Result<String> {
        let output = Command::new(&self.spec.runtime)
            .args(args)
            .output()
            .await
            .map_err(|e| OrchestratorError::Server(format!("cannot run {}: {}", self.spec.runtime, e)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OrchestratorError::Server(format!(
                "{} {} failed: {}",
                self.spec.runtime,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn is_running(&self) -> bool {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            self.name.clone(),
        ];
        matches!(self.runtime(&args).await.as_deref(), Ok("true"))
    }

    async fn remove(&self) {
        let args = ["rm".to_string(), "-f".to_string(), self.name.clone()];
        if let Err(e) = self.runtime(&args).await {
            tracing::debug!(container = %self.name, error = %e, "Container removal failed");
        }
    }

    pub async fn start(&self) -> Result<()> {
        let mut slot = self.container_id.lock().await;
        // A stale container with our name would make `run` fail.
        self.remove().await;

        let id = self
            .runtime(&run_args(&self.name, &self.spec, &self.env, &self.resources))
            .await?;
        tracing::debug!(container = %self.name, id = %id, image = %self.spec.image, "Container created");

        for attempt in 1..=self.spec.start_attempts {
            if self.is_running().await {
                tracing::debug!(container = %self.name, attempt, "Container running");
                self.http.open()?;
                *slot = Some(id);
                return Ok(());
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        self.remove().await;
        Err(OrchestratorError::Server(format!(
            "start timeout: container {} not running after {} checks",
            self.name, self.spec.start_attempts
        )))
    }

    pub async fn call(&self, request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        self.http.call(request, timeout).await
    }

    pub async fn call_batch(&self, requests: Vec<RpcRequest>, timeout: Duration) -> Result<Vec<RpcResponse>> {
        self.http.call_batch(requests, timeout).await
    }

    pub async fn probe(&self, timeout: Duration) -> bool {
        if self.container_id.lock().await.is_none() {
            return false;
        }
        tokio::time::timeout(timeout, self.is_running())
            .await
            .unwrap_or(false)
    }

    /// `stop -t <grace>` then remove.
    pub async fn stop(&self) -> Result<()> {
        let Some(id) = self.container_id.lock().await.take() else {
            return Ok(());
        };
        self.http.close();
        let args = [
            "stop".to_string(),
            "-t".to_string(),
            self.spec.shutdown_grace_secs.to_string(),
            self.name.clone(),
        ];
        if let Err(e) = self.runtime(&args).await {
            tracing::warn!(container = %self.name, id = %id, error = %e, "Container stop failed");
        }
        self.remove().await;
        Ok(())
    }
}
