//! RPC error types.

use thiserror::Error;

/// Errors of the L1 RPC client.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Connection establishment failed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A request failed after the connection was established.
    #[error("request error: {0}")]
    Request(String),

    /// Subscription setup failed.
    #[error("subscription error: {0}")]
    Subscription(String),
}

/// Result type alias for RPC operations.
pub type RpcResult<T> = Result<T, RpcError>;
