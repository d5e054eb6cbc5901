//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] wirebus_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] wirebus_core::CoreError),

    #[error("server shutting down")]
    ShuttingDown,
}
