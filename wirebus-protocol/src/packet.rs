//! Logical packet model.

use bytes::Bytes;
use serde_json::Value;

/// Identifier of the authentication handshake packet.
pub const AUTH_IDENTIFIER: &str = "__auth.plain";

/// Auth payload key for the authenticating identity.
pub const KEY_AUTH_IDENTIFIER: &str = "authIdentifier";

/// Auth payload key for the credential token.
pub const KEY_TOKEN: &str = "token";

/// Auth payload key added to the handshake echo.
pub const KEY_RESULT: &str = "result";

/// Header map key for the request id.
pub const KEY_REQUEST_ID: &str = "requestId";

/// Header map key for the joint `processor "." method` identifier.
pub const KEY_IDENTIFIER: &str = "identifier";

/// Header map key for the payload value in object mode.
pub const KEY_DATA: &str = "data";

/// Packet payload: either a raw byte array (binary mode on the wire) or an
/// arbitrary serializer-supported value (object mode).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Binary(Bytes),
    Value(Value),
}

impl Payload {
    pub fn is_binary(&self) -> bool {
        matches!(self, Payload::Binary(_))
    }

    /// Returns the value for object-mode payloads.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Payload::Value(v) => Some(v),
            Payload::Binary(_) => None,
        }
    }

    /// Returns the bytes for binary-mode payloads.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Payload::Binary(b) => Some(b),
            Payload::Value(_) => None,
        }
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Value(value)
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Binary(bytes)
    }
}

/// A logical packet.
///
/// `processor` and `method` travel jointly on the wire as
/// `processor "." method`; `connection_id` is set on receipt and never
/// transmitted.
#[derive(Debug, Clone)]
pub struct Packet {
    /// Request id for correlation.
    pub request_id: String,
    /// Target handler name.
    pub processor: String,
    /// Sub-operation on that handler.
    pub method: String,
    /// Id of the connection the packet arrived on (receive side only).
    pub connection_id: String,
    /// Opaque payload.
    pub payload: Payload,
}

impl Packet {
    pub fn new(
        request_id: impl Into<String>,
        identifier: &str,
        payload: impl Into<Payload>,
    ) -> Self {
        let (processor, method) = split_identifier(identifier);
        Self {
            request_id: request_id.into(),
            processor: processor.to_string(),
            method: method.to_string(),
            connection_id: String::new(),
            payload: payload.into(),
        }
    }

    /// Joint identifier as transmitted on the wire.
    pub fn identifier(&self) -> String {
        format!("{}.{}", self.processor, self.method)
    }

    /// Builds a response carrying `payload` back under the same request id
    /// and identifier.
    pub fn response(&self, payload: impl Into<Payload>) -> Self {
        Self {
            request_id: self.request_id.clone(),
            processor: self.processor.clone(),
            method: self.method.clone(),
            connection_id: String::new(),
            payload: payload.into(),
        }
    }

    /// Whether this is the authentication handshake packet.
    pub fn is_auth(&self) -> bool {
        self.identifier() == AUTH_IDENTIFIER
    }
}

/// Splits a joint identifier on the first dot. The method part defaults to
/// empty when no dot is present.
pub fn split_identifier(identifier: &str) -> (&str, &str) {
    match identifier.split_once('.') {
        Some((processor, method)) => (processor, method),
        None => (identifier, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_identifier() {
        assert_eq!(split_identifier("echo.ping"), ("echo", "ping"));
        assert_eq!(split_identifier("echo"), ("echo", ""));
        assert_eq!(split_identifier("a.b.c"), ("a", "b.c"));
        assert_eq!(split_identifier(""), ("", ""));
    }

    #[test]
    fn test_packet_identifier_roundtrip() {
        let packet = Packet::new("7", "echo.ping", json!("hi"));
        assert_eq!(packet.processor, "echo");
        assert_eq!(packet.method, "ping");
        assert_eq!(packet.identifier(), "echo.ping");
    }

    #[test]
    fn test_response_keeps_correlation() {
        let packet = Packet::new("42", "store.put", json!({"k": 1}));
        let response = packet.response(json!({"ok": true}));
        assert_eq!(response.request_id, "42");
        assert_eq!(response.identifier(), "store.put");
        assert!(response.connection_id.is_empty());
    }

    #[test]
    fn test_auth_identifier() {
        let packet = Packet::new("1", AUTH_IDENTIFIER, json!({}));
        assert!(packet.is_auth());
        assert_eq!(packet.processor, "__auth");
        assert_eq!(packet.method, "plain");
    }
}
