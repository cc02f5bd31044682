//! Active health checking.
//!
//! # Responsibilities
//! - Periodically probe each monitored instance
//! - React immediately to unexpected backend exits
//! - Emit `HealthEvent`s on state transitions

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::HealthCheckConfig;
use crate::health::{HealthEvent, HealthMonitor, HealthState, Transition};
use crate::instance::{InstanceEvent, ServerInstance};
use crate::observability::metrics;

/// One probe task per monitored instance.
pub struct IntervalHealthMonitor {
    defaults: HealthCheckConfig,
    tasks: DashMap<String, JoinHandle<()>>,
    events: mpsc::UnboundedSender<HealthEvent>,
}

impl IntervalHealthMonitor {
    /// Returns the monitor and the stream of transitions it emits.
    pub fn new(defaults: HealthCheckConfig) -> (Self, mpsc::UnboundedReceiver<HealthEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let monitor = Self {
            defaults,
            tasks: DashMap::new(),
            events,
        };
        (monitor, rx)
    }

    pub fn monitored(&self) -> usize {
        self.tasks.len()
    }

    /// Abort every probe task.
    pub fn stop_all(&self) {
        self.tasks.retain(|_, task| {
            task.abort();
            false
        });
    }
}

impl HealthMonitor for IntervalHealthMonitor {
    fn monitor(&self, instance: Arc<ServerInstance>) {
        let config = instance
            .config()
            .health_check
            .clone()
            .unwrap_or_else(|| self.defaults.clone());
        let id = instance.id().to_string();
        let exits = instance.subscribe();
        let task = tokio::spawn(probe_loop(instance, exits, config, self.events.clone()));
        if let Some(previous) = self.tasks.insert(id, task) {
            previous.abort();
        }
    }

    fn unmonitor(&self, id: &str) {
        if let Some((_, task)) = self.tasks.remove(id) {
            task.abort();
        }
    }
}

impl Drop for IntervalHealthMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

async fn probe_loop(
    instance: Arc<ServerInstance>,
    exits: broadcast::Receiver<InstanceEvent>,
    config: HealthCheckConfig,
    events: mpsc::UnboundedSender<HealthEvent>,
) {
    let id = instance.id().to_string();
    let mut exits = Some(exits);
    let mut state = HealthState::new(config.healthy_threshold, config.unhealthy_threshold);

    let interval = Duration::from_secs(config.interval_secs.max(1));
    let mut ticker = time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // instances are registered right after a successful start
    ticker.tick().await;

    tracing::debug!(
        server = %id,
        interval = config.interval_secs,
        enabled = config.enabled,
        "Health monitor attached"
    );

    loop {
        let transition = tokio::select! {
            _ = ticker.tick(), if config.enabled => {
                if instance.health_check().await {
                    state.mark_success()
                } else {
                    tracing::warn!(server = %id, "Health check failed");
                    state.mark_failure()
                }
            }
            event = next_exit(&mut exits) => match event {
                Some(InstanceEvent::Exited { expected: false, code, .. }) => {
                    tracing::warn!(server = %id, ?code, "Backend exit observed by health monitor");
                    state.force_unhealthy()
                }
                _ => None,
            },
        };

        let event = match transition {
            Some(Transition::BecameUnhealthy) => HealthEvent::Unhealthy(id.clone()),
            Some(Transition::BecameHealthy) => HealthEvent::Recovered(id.clone()),
            None => continue,
        };
        metrics::record_server_health(&id, state.is_healthy());
        if events.send(event).is_err() {
            break;
        }
    }
}

/// Next exit notification. Pends forever once the instance's channel closes.
async fn next_exit(exits: &mut Option<broadcast::Receiver<InstanceEvent>>) -> Option<InstanceEvent> {
    loop {
        let Some(rx) = exits.as_mut() else {
            return std::future::pending().await;
        };
        match rx.recv().await {
            Ok(event) => return Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => *exits = None,
        }
    }
}
