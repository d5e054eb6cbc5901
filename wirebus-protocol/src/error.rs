//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or packet handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("checksum mismatch: expected {expected:02x?}, got {actual:02x?}")]
    ChecksumMismatch { expected: [u8; 2], actual: [u8; 2] },

    #[error("never-ending stream: frame exceeds {max} bytes")]
    OversizedFrame { max: usize },

    #[error("negative frame length: {0}")]
    NegativeLength(i32),

    #[error("framer is poisoned by an earlier fatal error")]
    Poisoned,

    #[error("packet header too large: {size} bytes (max {max})")]
    HeaderTooLarge { size: usize, max: usize },

    #[error("invalid packet with empty head info")]
    EmptyHead,

    #[error("truncated packet payload: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("serializer error: {0}")]
    Serialize(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = ProtocolError::ChecksumMismatch {
            expected: [0xab, 0xcd],
            actual: [0x00, 0x01],
        };
        assert!(err.to_string().contains("checksum"));

        let err = ProtocolError::OversizedFrame { max: 100 };
        assert!(err.to_string().contains("never-ending stream"));

        let err = ProtocolError::EmptyHead;
        assert_eq!(err.to_string(), "invalid packet with empty head info");

        let err = ProtocolError::MissingField("identifier");
        assert!(err.to_string().contains("identifier"));
    }
}
