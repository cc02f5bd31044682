//! Error taxonomy shared by every subsystem.
//!
//! # Design Decisions
//! - One enum for the whole core; callers match on the variant, not on strings
//! - `Clone` so a single failure can fan out to every deduplicated waiter
//! - Only `Network` and `Timeout` are transient (eligible for retry)

use crate::protocol::RpcError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by the orchestration layer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum OrchestratorError {
    /// A `ServerConfig` or other configuration value was rejected.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A backend failed to start or failed while running.
    #[error("server error: {0}")]
    Server(String),

    /// Transport-level failure talking to a backend.
    #[error("network error: {0}")]
    Network(String),

    /// The request itself is malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The backend's circuit breaker rejected the call without contacting it.
    #[error("circuit open for server {0}")]
    CircuitOpen(String),

    /// An acquire, call or batch deadline elapsed.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Unknown server, pool or other identifier.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend answered with an error envelope.
    #[error("backend error {code}: {message}")]
    Rpc { code: i64, message: String },
}

impl OrchestratorError {
    /// True for failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }

    /// Stable short name, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Server(_) => "server",
            Self::Network(_) => "network",
            Self::Validation(_) => "validation",
            Self::CircuitOpen(_) => "circuit_open",
            Self::Timeout(_) => "timeout",
            Self::NotFound(_) => "not_found",
            Self::Rpc { .. } => "rpc",
        }
    }

    /// Convert into a JSON-RPC error object for the wire.
    pub fn to_rpc_error(&self) -> RpcError {
        let code = match self {
            Self::Validation(_) => -32600,
            Self::NotFound(_) => -32601,
            Self::Server(_) => -32000,
            Self::Network(_) => -32001,
            Self::Timeout(_) => -32002,
            Self::CircuitOpen(_) => -32003,
            Self::Configuration(_) => -32004,
            Self::Rpc { code, .. } => *code,
        };
        let message = match self {
            Self::Rpc { message, .. } => message.clone(),
            other => other.to_string(),
        };
        RpcError {
            code,
            message,
            data: None,
        }
    }
}

impl From<RpcError> for OrchestratorError {
    fn from(err: RpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Validation(format!("malformed backend response: {}", err))
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        Self::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(OrchestratorError::Network("reset".into()).is_transient());
        assert!(OrchestratorError::Timeout("call".into()).is_transient());
        assert!(!OrchestratorError::CircuitOpen("a".into()).is_transient());
        assert!(!OrchestratorError::Validation("bad".into()).is_transient());
    }

    #[test]
    fn rpc_error_roundtrip_keeps_code() {
        let err: OrchestratorError = RpcError {
            code: -32602,
            message: "invalid params".into(),
            data: None,
        }
        .into();
        let wire = err.to_rpc_error();
        assert_eq!(wire.code, -32602);
        assert_eq!(wire.message, "invalid params");
    }
}
