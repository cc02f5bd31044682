//! Subprocess-backed servers.
//!
//! The child speaks line-delimited JSON-RPC on stdin/stdout, or HTTP when an
//! `endpoint` is configured. An exit watcher owns the child and reports exits
//! through `Liveness`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::{ResourceLimits, ServerConfig, SubprocessSpec};
use crate::error::{OrchestratorError, Result};
use crate::instance::http::HttpRpcClient;
use crate::instance::{InstanceContext, Liveness};
use crate::protocol::{PendingCalls, RpcRequest, RpcResponse};

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChildState {
    Running,
    Exited(Option<i32>),
}

impl ChildState {
    fn has_exited(&self) -> bool {
        matches!(self, ChildState::Exited(_))
    }
}

struct ChildRuntime {
    stdin: Option<mpsc::Sender<Vec<u8>>>,
    kill: Option<oneshot::Sender<()>>,
    state: watch::Receiver<ChildState>,
    stopping: Arc<AtomicBool>,
    io_tasks: Vec<JoinHandle<()>>,
}

impl ChildRuntime {
    fn is_running(&self) -> bool {
        !self.state.borrow().has_exited()
    }
}

pub struct SubprocessDriver {
    id: String,
    spec: SubprocessSpec,
    env: BTreeMap<String, String>,
    resources: ResourceLimits,
    log_dir: Option<PathBuf>,
    http: Option<HttpRpcClient>,
    pending: Arc<PendingCalls>,
    liveness: Liveness,
    pid: AtomicU32,
    runtime: Mutex<Option<ChildRuntime>>,
}

fn open_log(dir: &Path, name: &str) -> std::io::Result<std::fs::File> {
    std::fs::create_dir_all(dir)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(name))
}

impl SubprocessDriver {
    pub fn new(config: &ServerConfig, spec: SubprocessSpec, ctx: &InstanceContext, liveness: Liveness) -> Self {
        let http = spec
            .endpoint
            .as_ref()
            .map(|url| HttpRpcClient::new(Arc::clone(&ctx.pools), &config.id, url.clone()));
        Self {
            id: config.id.clone(),
            spec,
            env: config.env.clone(),
            resources: config.resources.clone(),
            log_dir: ctx.log_dir.clone(),
            http,
            pending: Arc::new(PendingCalls::new()),
            liveness,
            pid: AtomicU32::new(0),
            runtime: Mutex::new(None),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self.pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    fn log_target(&self, stream: &str) -> Stdio {
        let Some(dir) = &self.log_dir else {
            return Stdio::null();
        };
        let name = format!("{}.{}.log", self.id, stream);
        match open_log(dir, &name) {
            Ok(file) => Stdio::from(file),
            Err(e) => {
                tracing::warn!(server = %self.id, file = %name, error = %e, "Cannot open log file, discarding output");
                Stdio::null()
            }
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.spec.command);
        cmd.args(&self.spec.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stderr(self.log_target("err"))
            .kill_on_drop(true);
        if self.http.is_some() {
            cmd.stdout(self.log_target("out"));
        } else {
            cmd.stdout(Stdio::piped());
        }
        if let Some(dir) = &self.spec.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    pub async fn start(&self) -> Result<()> {
        let mut slot = self.runtime.lock().await;
        if slot.as_ref().is_some_and(ChildRuntime::is_running) {
            return Ok(());
        }
        *slot = None;

        if self.resources.memory.is_some() || self.resources.cpus.is_some() {
            tracing::info!(
                server = %self.id,
                memory = ?self.resources.memory,
                cpus = ?self.resources.cpus,
                "Resource limits recorded for subprocess (not enforced)"
            );
        }

        let mut child = self.command().spawn().map_err(|e| {
            OrchestratorError::Server(format!("failed to spawn '{}': {}", self.spec.command, e))
        })?;
        self.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);

        let mut io_tasks = Vec::new();
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
        if let Some(mut stdin) = child.stdin.take() {
            io_tasks.push(tokio::spawn(async move {
                while let Some(line) = stdin_rx.recv().await {
                    if stdin.write_all(&line).await.is_err() || stdin.flush().await.is_err() {
                        break;
                    }
                }
            }));
        }
        if let Some(stdout) = child.stdout.take() {
            let pending = Arc::clone(&self.pending);
            let id = self.id.clone();
            io_tasks.push(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        pending.complete_frame(line.as_bytes());
                    }
                }
                tracing::debug!(server = %id, "Subprocess stdout closed");
                pending.fail_all();
            }));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ChildState::Running);
        let stopping = Arc::new(AtomicBool::new(false));
        tokio::spawn(watch_exit(
            child,
            kill_rx,
            state_tx,
            Arc::clone(&self.pending),
            self.liveness.clone(),
            Arc::clone(&stopping),
        ));

        // Readiness is a settle delay; exiting inside it is a failed start.
        let mut state = state_rx.clone();
        let settle = Duration::from_millis(self.spec.settle_ms);
        if let Ok(result) = tokio::time::timeout(settle, state.wait_for(ChildState::has_exited)).await {
            let code = result.map(|s| *s).ok();
            for task in io_tasks {
                task.abort();
            }
            self.pid.store(0, Ordering::SeqCst);
            return Err(OrchestratorError::Server(format!(
                "{} exited during startup ({:?})",
                self.id, code
            )));
        }

        if let Some(http) = &self.http {
            http.open()?;
        }

        *slot = Some(ChildRuntime {
            stdin: Some(stdin_tx),
            kill: Some(kill_tx),
            state: state_rx,
            stopping,
            io_tasks,
        });
        Ok(())
    }

    async fn call_stdio(&self, mut request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        let writer = {
            let slot = self.runtime.lock().await;
            slot.as_ref()
                .filter(|rt| rt.is_running())
                .and_then(|rt| rt.stdin.clone())
                .ok_or_else(|| OrchestratorError::Server(format!("{} is not running", self.id)))?
        };

        let (key, original) = request.tag();
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| OrchestratorError::Validation(format!("unserializable request: {}", e)))?;
        line.push(b'\n');

        let rx = self.pending.register(key.clone());
        if writer.send(line).await.is_err() {
            self.pending.cancel(&key);
            return Err(OrchestratorError::Network(format!("stdin of {} is closed", self.id)));
        }
        let mut response = self.pending.wait(&key, rx, timeout).await?;
        response.id = original;
        Ok(response)
    }

    pub async fn call(&self, request: RpcRequest, timeout: Duration) -> Result<RpcResponse> {
        match &self.http {
            Some(http) => http.call(request, timeout).await,
            None => self.call_stdio(request, timeout).await,
        }
    }

    pub async fn call_batch(&self, requests: Vec<RpcRequest>, timeout: Duration) -> Result<Vec<RpcResponse>> {
        match &self.http {
            Some(http) => http.call_batch(requests, timeout).await,
            None => try_join_all(requests.into_iter().map(|r| self.call_stdio(r, timeout))).await,
        }
    }

    pub async fn probe(&self, timeout: Duration) -> bool {
        let running = self
            .runtime
            .lock()
            .await
            .as_ref()
            .is_some_and(ChildRuntime::is_running);
        if !running {
            return false;
        }
        match &self.http {
            Some(http) => http.probe(timeout).await,
            None => true,
        }
    }

    /// Close stdin, wait out the grace period, then kill.
    pub async fn stop(&self) -> Result<()> {
        let Some(mut rt) = self.runtime.lock().await.take() else {
            return Ok(());
        };
        rt.stopping.store(true, Ordering::SeqCst);
        if let Some(http) = &self.http {
            http.close();
        }
        drop(rt.stdin.take());

        let grace = Duration::from_secs(self.spec.shutdown_grace_secs);
        let exited = tokio::time::timeout(grace, rt.state.wait_for(ChildState::has_exited))
            .await
            .is_ok();
        if !exited {
            tracing::warn!(server = %self.id, ?grace, "Subprocess ignored stdin close, killing");
            if let Some(kill) = rt.kill.take() {
                let _ = kill.send(());
            }
            let _ = rt.state.wait_for(ChildState::has_exited).await;
        }
        for task in rt.io_tasks {
            task.abort();
        }
        self.pending.fail_all();
        self.pid.store(0, Ordering::SeqCst);
        Ok(())
    }
}

async fn watch_exit(
    mut child: Child,
    kill: oneshot::Receiver<()>,
    state: watch::Sender<ChildState>,
    pending: Arc<PendingCalls>,
    liveness: Liveness,
    stopping: Arc<AtomicBool>,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        _ = kill => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            let _ = child.start_kill();
            child.wait().await
        }
    };
    let code = status.ok().and_then(|s| s.code());
    pending.fail_all();
    let _ = state.send(ChildState::Exited(code));
    liveness.exited(code, stopping.load(Ordering::SeqCst));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Deployment;
    use crate::instance::tests::{context, echo_config};
    use crate::instance::{InstanceEvent, ServerInstance};
    use serde_json::json;

    fn driver(config: &ServerConfig, ctx: &InstanceContext) -> SubprocessDriver {
        let Deployment::Subprocess(spec) = &config.deployment else {
            panic!("not a subprocess config");
        };
        SubprocessDriver::new(config, spec.clone(), ctx, Liveness::new(&config.id))
    }

    fn shell(id: &str, script: &str) -> ServerConfig {
        let mut config = echo_config(id);
        if let Deployment::Subprocess(spec) = &mut config.deployment {
            spec.command = "sh".into();
            spec.args = vec!["-c".into(), script.into()];
        }
        config
    }

    #[tokio::test]
    async fn stdio_round_trip_restores_ids() {
        let config = echo_config("cat");
        let d = driver(&config, &context());
        d.start().await.unwrap();

        let response = d
            .call(RpcRequest::new("tools/call", Some(json!({"x": 1}))).with_id("mine"), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(response.id, Some(json!("mine")));

        let batch = d
            .call_batch(
                vec![
                    RpcRequest::new("a", None).with_id(1),
                    RpcRequest::new("b", None).with_id(2),
                ],
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(batch[0].id, Some(json!(1)));
        assert_eq!(batch[1].id, Some(json!(2)));

        d.stop().await.unwrap();
        assert!(d.pid().is_none());
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let config = shell("mute", "exec sleep 30");
        let d = driver(&config, &context());
        d.start().await.unwrap();

        let err = d
            .call(RpcRequest::new("x", None), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(_)));
        assert!(d.pending.is_empty());
        d.stop().await.unwrap();
    }

    #[tokio::test]
    async fn exit_during_settle_fails_start() {
        let config = shell("quitter", "exit 3");
        let d = driver(&config, &context());
        let err = d.start().await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Server(msg) if msg.contains("exited during startup")));
        assert!(!d.probe(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn stubborn_child_is_killed_after_grace() {
        let config = shell("stubborn", "trap '' TERM; exec sleep 30");
        let d = driver(&config, &context());
        d.start().await.unwrap();

        let started = std::time::Instant::now();
        d.stop().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!d.probe(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn stderr_goes_to_log_dir() {
        let dir = std::env::temp_dir().join(format!("mcp-orch-{}", uuid::Uuid::new_v4()));
        let mut ctx = context();
        ctx.log_dir = Some(dir.clone());

        let config = shell("noisy", "echo oops >&2; exec cat");
        let d = driver(&config, &ctx);
        d.start().await.unwrap();
        d.stop().await.unwrap();

        let log = std::fs::read_to_string(dir.join("noisy.err.log")).unwrap();
        assert!(log.contains("oops"));
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn external_kill_flips_health() {
        let mut config = echo_config("victim");
        config.resources.memory = Some("256m".into());
        let instance = ServerInstance::new(config, &context());
        instance.initialize().await.unwrap();
        assert!(instance.health_check().await);

        let mut events = instance.subscribe();
        let pid = instance.pid().unwrap();
        let status = std::process::Command::new("kill")
            .args(["-9", &pid.to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, InstanceEvent::Exited { expected: false, .. }));
        assert!(!instance.is_healthy());
        assert!(!instance.health_check().await);
        instance.shutdown().await.unwrap();
    }
}
