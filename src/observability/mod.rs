//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (structured log events via tracing)
//!     → metrics.rs (counters, gauges, histograms)
//!
//! Consumers:
//!     → Log aggregation (stdout, pretty or JSON)
//!     → Metrics endpoint (Prometheus scrape)
//! ```
//!
//! # Design Decisions
//! - Structured fields (server, pool, outcome) rather than formatted strings
//! - Metrics are write-only from the core; nothing reads them back
//! - Recording is a no-op until an exporter is installed

pub mod logging;
pub mod metrics;
