//! Timeout enforcement.
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - Timeout errors are distinct from other errors
//! - Work behind an expired deadline is abandoned, not interrupted

use std::future::Future;
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Run `fut` with a deadline, mapping expiry to `OrchestratorError::Timeout`.
pub async fn with_timeout<T, F>(duration: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(OrchestratorError::Timeout(format!(
            "{} exceeded {:?}",
            what, duration
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn expiry_maps_to_timeout() {
        let err = with_timeout(Duration::from_millis(10), "slow call", async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::Timeout(ref m) if m.contains("slow call")));
    }

    #[tokio::test]
    async fn inner_result_passes_through() {
        let value = with_timeout(Duration::from_secs(1), "fast", async { Ok(5) })
            .await
            .unwrap();
        assert_eq!(value, 5);
    }
}
