//! Exponential backoff with jitter.

use std::time::Duration;
use rand::Rng;

use crate::config::RetryConfig;

/// Delay before retry number `attempt` (0 for the first retry).
///
/// `initial_delay * multiplier^attempt` plus up to `jitter_ratio` of that
/// delay. The result never exceeds `max_delay`.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let raw = config.initial_delay_ms as f64 * config.multiplier.powi(exponent);
    let capped_delay = if raw.is_finite() {
        (raw as u64).min(config.max_delay_ms)
    } else {
        config.max_delay_ms
    };

    let jitter_range = (capped_delay as f64 * config.jitter_ratio) as u64;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay.saturating_add(jitter).min(config.max_delay_ms))
}
