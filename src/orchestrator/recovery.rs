//! Automatic recovery of unhealthy instances.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::{OrchestratorSettings, RestartPolicy};
use crate::load_balancer::LoadBalancer;
use crate::observability::metrics;
use crate::orchestrator::ManagedServer;

/// Delays between restart attempts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RecoverySchedule {
    pub first: Duration,
    pub retry: Duration,
}

impl RecoverySchedule {
    /// A per-server restart delay replaces both orchestrator-wide delays.
    pub fn new(settings: &OrchestratorSettings, policy: &RestartPolicy) -> Self {
        match policy.restart_delay() {
            Some(delay) => Self { first: delay, retry: delay },
            None => Self {
                first: settings.recovery_delay(),
                retry: settings.recovery_retry_delay(),
            },
        }
    }
}

/// Restart `server` until it comes back or its restart budget runs out.
///
/// On success the breaker and error counter are cleared and the instance is
/// made selectable again.
pub(crate) async fn recover(
    server: Arc<ManagedServer>,
    load_balancer: Arc<dyn LoadBalancer>,
    schedule: RecoverySchedule,
    mut shutdown: broadcast::Receiver<()>,
) {
    let id = server.instance.id().to_string();
    let max_restarts = server.instance.config().restart.max_restarts;
    let mut delay = schedule.first;

    for attempt in 1..=max_restarts {
        tracing::info!(server = %id, attempt, delay = ?delay, "Recovery scheduled");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.recv() => {
                tracing::debug!(server = %id, "Recovery cancelled by shutdown");
                return;
            }
        }

        match server.instance.restart().await {
            Ok(()) => {
                server.breaker.reset();
                server.instance.reset_errors();
                load_balancer.mark_healthy(&id);
                metrics::record_recovery_attempt(&id, "success");
                tracing::info!(server = %id, attempt, "Server recovered");
                return;
            }
            Err(e) => {
                metrics::record_recovery_attempt(&id, "failure");
                tracing::warn!(server = %id, attempt, error = %e, "Recovery attempt failed");
                delay = schedule.retry;
            }
        }
    }

    tracing::error!(
        server = %id,
        max_restarts,
        "Giving up on recovery, server stays unhealthy"
    );
}
