//! MCP server orchestrator.
//!
//! # Architecture Overview
//!
//! ```text
//!     Caller ──▶ batching engine ──▶ orchestrator ──▶ load balancer
//!                 (cache, dedup)      (breaker,        (healthy, by type)
//!                                      error counts)         │
//!                                                            ▼
//!                                                    server instance
//!                                              container │ subprocess │ socket
//!                                                   │                    │
//!                                            pooled HTTP          stdio / ws
//!
//!     health monitor ──(unhealthy / recovered)──▶ orchestrator ──▶ recovery
//!     admin API ──▶ orchestrator, pools, cache
//! ```

use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use mcp_orchestrator::admin::{self, AdminState};
use mcp_orchestrator::config::loader::load_config;
use mcp_orchestrator::config::watcher::ConfigWatcher;
use mcp_orchestrator::config::OrchestratorConfig;
use mcp_orchestrator::lifecycle::{Runtime, Signal, Signals};
use mcp_orchestrator::observability::{logging, metrics};

#[derive(Parser)]
#[command(name = "mcp-orchestrator")]
#[command(about = "Orchestration and resilience layer for MCP servers", long_about = None)]
struct Args {
    /// TOML or JSON configuration file.
    #[arg(short, long, default_value = "orchestrator.toml")]
    config: PathBuf,

    /// Reconcile servers whenever the file changes.
    #[arg(long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = if args.config.exists() {
        load_config(&args.config)?
    } else {
        OrchestratorConfig::default()
    };
    logging::init_logging(&config.observability);
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?args.config,
        servers = config.servers.len(),
        "mcp-orchestrator starting"
    );
    if !args.config.exists() {
        tracing::warn!(path = ?args.config, "Config file not found, starting with defaults");
    }

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let mut runtime = Runtime::start(config.clone()).await?;

    if config.admin.enabled {
        let state = AdminState {
            orchestrator: runtime.orchestrator.clone(),
            engine: runtime.engine.clone(),
            api_key: config.admin.api_key.as_str().into(),
        };
        let router = admin::setup_admin_router(state, config.orchestrator.request_timeout());
        let listener = TcpListener::bind(&config.admin.bind_address).await?;
        let shutdown = runtime.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = admin::serve(router, listener, async move { shutdown.wait().await }).await {
                tracing::error!(error = %e, "Admin API stopped");
            }
        });
    }

    let (_keepalive, mut updates) = mpsc::unbounded_channel::<OrchestratorConfig>();
    let _watcher = if args.watch {
        let (watcher, rx) = ConfigWatcher::new(&args.config);
        updates = rx;
        Some(watcher.run()?)
    } else {
        None
    };

    let mut signals = Signals::new()?;
    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Signal::Shutdown => break,
                Signal::Reload => match load_config(&args.config) {
                    Ok(next) => {
                        if let Err(e) = runtime.reconcile(next).await {
                            tracing::error!(error = %e, "Reload rejected");
                        }
                    }
                    Err(e) => tracing::error!(error = %e, "Reload failed"),
                },
            },
            Some(next) = updates.recv() => {
                if let Err(e) = runtime.reconcile(next).await {
                    tracing::error!(error = %e, "Reload rejected");
                }
            }
        }
    }

    runtime.stop().await;
    Ok(())
}
