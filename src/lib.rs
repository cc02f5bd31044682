//! Orchestration and resilience layer for MCP servers.

pub mod admin;
pub mod batching;
pub mod config;
pub mod error;
pub mod health;
pub mod instance;
pub mod lifecycle;
pub mod load_balancer;
pub mod observability;
pub mod orchestrator;
pub mod pool;
pub mod priority;
pub mod protocol;
pub mod resilience;

pub use batching::{BatchingEngine, RequestOptions, ResponseCache};
pub use config::schema::{OrchestratorConfig, ServerConfig};
pub use error::{OrchestratorError, Result};
pub use lifecycle::{Runtime, Shutdown};
pub use orchestrator::Orchestrator;
pub use priority::Priority;
pub use protocol::{RpcRequest, RpcResponse};
