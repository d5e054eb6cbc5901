//! Core error types.

use crate::transport::TransportError;
use thiserror::Error;
use wirebus_protocol::ProtocolError;

/// Errors from connection handling and dispatch.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("no processor registered for '{0}'")]
    ProcessorNotFound(String),

    #[error("processor failed: {0}")]
    Handler(String),

    #[error("dispatch queue closed")]
    QueueClosed,
}
