//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wirebus_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] wirebus_core::CoreError),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication rejected by server")]
    AuthRejected,
}
