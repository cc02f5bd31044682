//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Pools → Balancer → Health monitor → Orchestrator
//!     → Register servers → Batching engine + cache sweeper
//!
//! Shutdown (shutdown.rs):
//!     Signal received → Flush queued batches → Stop instances → Close pools
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then core, then listeners
//! - A backend that fails to start is logged and skipped; bad config is fatal

pub mod shutdown;
pub mod signals;
pub mod startup;

pub use shutdown::Shutdown;
pub use signals::{Signal, Signals};
pub use startup::Runtime;
