//! Request/response envelope spoken to every backend.
//!
//! # Data Flow
//! ```text
//! Caller envelope { id?, method, params }
//!     → envelope.rs (validate, tag with correlation id)
//!     → driver writes it to the backend
//!     → correlation.rs (match inbound response to the waiting call)
//!     → caller's original id restored on the response
//! ```

pub mod correlation;
pub mod envelope;

pub use correlation::PendingCalls;
pub use envelope::{RpcError, RpcRequest, RpcResponse, JSONRPC_VERSION};
