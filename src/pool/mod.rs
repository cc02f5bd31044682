//! Connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! caller → ConnectionPoolManager (by name)
//!     → ConnectionPool::acquire (idle pick / create / priority wait)
//!     → Checkout guard (exclusive while checked out)
//!     → ConnectionPool::release on drop (reuse or destroy + replenish)
//!
//! Background (per pool):
//!     health tick     → ping idle connections
//!     validation tick → retire idle/lifetime/error-rate violators
//! ```

pub mod connection;
pub mod factory;
pub mod manager;
pub mod policy;
#[allow(clippy::module_inception)]
pub mod pool;

pub use connection::{ConnectionId, ConnectionInfo, Endpoint, PooledConnection, Protocol, RetireReason};
pub use factory::{ConnectionFactory, HttpTransport, Transport, TransportConnector};
pub use manager::ConnectionPoolManager;
pub use pool::{AcquireOptions, Checkout, ConnectionPool, PoolStats};
