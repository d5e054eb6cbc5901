//! Pluggable payload serializer.

use crate::error::ProtocolError;
use serde_json::Value;

/// Converts header/payload values to and from bytes.
///
/// The codec treats the serializer as an external collaborator; any format
/// works as long as both ends agree. JSON is the default.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, ProtocolError>;
    fn deserialize(&self, data: &[u8]) -> Result<Value, ProtocolError>;
}

/// JSON serializer backed by serde_json.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &Value) -> Result<Vec<u8>, ProtocolError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize(&self, data: &[u8]) -> Result<Value, ProtocolError> {
        Ok(serde_json::from_slice(data)?)
    }
}
