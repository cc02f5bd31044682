//! Instance health state machine.
//!
//! # States
//! - Healthy: instance receives traffic
//! - Unhealthy: instance excluded from load balancing
//!
//! # State Transitions
//! ```text
//! Healthy → Unhealthy: consecutive failures >= unhealthy_threshold
//! Unhealthy → Healthy: consecutive successes >= healthy_threshold
//! ```
//!
//! # Design Decisions
//! - Hysteresis prevents flapping
//! - Counters reset on state transition

/// A state change produced by one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameUnhealthy,
    BecameHealthy,
}

#[derive(Debug, Clone)]
pub struct HealthState {
    healthy: bool,
    consecutive_successes: u32,
    consecutive_failures: u32,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl HealthState {
    /// Starts healthy: instances are registered only after a successful start.
    pub fn new(healthy_threshold: u32, unhealthy_threshold: u32) -> Self {
        Self {
            healthy: true,
            consecutive_successes: 0,
            consecutive_failures: 0,
            healthy_threshold: healthy_threshold.max(1),
            unhealthy_threshold: unhealthy_threshold.max(1),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn mark_success(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        if self.healthy {
            return None;
        }
        self.consecutive_successes += 1;
        if self.consecutive_successes >= self.healthy_threshold {
            self.healthy = true;
            self.consecutive_successes = 0;
            return Some(Transition::BecameHealthy);
        }
        None
    }

    pub fn mark_failure(&mut self) -> Option<Transition> {
        self.consecutive_successes = 0;
        if !self.healthy {
            return None;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.unhealthy_threshold {
            return self.force_unhealthy();
        }
        None
    }

    /// Skip the threshold, e.g. when the backend process is gone.
    pub fn force_unhealthy(&mut self) -> Option<Transition> {
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
        if !self.healthy {
            return None;
        }
        self.healthy = false;
        Some(Transition::BecameUnhealthy)
    }
}
