//! Error types for RPC client operations

use thiserror::Error;

/// Result type for RPC client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors raised by the client's write path and lifecycle operations.
///
/// Protocol-level failures never surface here: they are converted to wire
/// error responses or to a "no response" call outcome.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Write-path failures on the underlying byte channel
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Outbound message could not be serialized
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection has been closed
    #[error("connection closed")]
    Closed,
}
