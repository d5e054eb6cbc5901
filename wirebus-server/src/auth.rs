//! Per-connection authentication gate.
//!
//! Every new connection must open with an auth packet
//! (`identifier = "__auth.plain"`, payload `{authIdentifier, token}`)
//! before anything reaches the dispatch pool. The acceptance policy is
//! intentionally permissive (any non-empty identifier/token pair passes)
//! and is meant to be swapped for a real credential check. The lockout
//! behavior around it is the contract: three consecutive failures close
//! the connection, and a fourth attempt is never evaluated.

use serde_json::{json, Value};
use wirebus_protocol::{Packet, KEY_AUTH_IDENTIFIER, KEY_RESULT, KEY_TOKEN};

/// Failures tolerated before the connection is cut.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// Outcome of evaluating one pre-auth packet.
#[derive(Debug)]
pub enum AuthOutcome {
    /// Credentials accepted; the connection takes `identity` as its id and
    /// `response` echoes the payload with `result: true`.
    Accepted { identity: String, response: Packet },
    /// Credentials rejected; `response` carries `result: false`.
    Rejected { response: Packet },
    /// Failure budget exhausted; close without evaluating further input.
    LockedOut,
}

/// Tracks authentication progress for one connection.
#[derive(Debug)]
pub struct AuthGate {
    failures: u32,
    max_failures: u32,
    authenticated: bool,
}

impl Default for AuthGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES)
    }
}

impl AuthGate {
    pub fn new(max_failures: u32) -> Self {
        Self {
            failures: 0,
            max_failures,
            authenticated: false,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    /// Evaluates one packet received before authentication completed.
    pub fn evaluate(&mut self, packet: &Packet) -> AuthOutcome {
        match extract_credentials(packet) {
            Some((identity, _token)) => {
                self.authenticated = true;
                self.failures = 0;
                let response = auth_response(packet, true);
                AuthOutcome::Accepted { identity, response }
            }
            None => {
                self.failures += 1;
                if self.failures >= self.max_failures {
                    AuthOutcome::LockedOut
                } else {
                    AuthOutcome::Rejected {
                        response: auth_response(packet, false),
                    }
                }
            }
        }
    }
}

/// Pulls acceptable credentials out of an auth packet.
///
/// Non-auth packets, non-object payloads and empty fields all fail.
fn extract_credentials(packet: &Packet) -> Option<(String, String)> {
    if !packet.is_auth() {
        return None;
    }
    let map = packet.payload.as_value()?.as_object()?;
    let identity = map.get(KEY_AUTH_IDENTIFIER)?.as_str()?;
    let token = map.get(KEY_TOKEN)?.as_str()?;
    if identity.is_empty() || token.is_empty() {
        return None;
    }
    Some((identity.to_string(), token.to_string()))
}

/// Builds the auth echo: the original payload map with `result` added.
fn auth_response(packet: &Packet, result: bool) -> Packet {
    let mut map = packet
        .payload
        .as_value()
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    map.insert(KEY_RESULT.to_string(), json!(result));
    packet.response(Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wirebus_protocol::AUTH_IDENTIFIER;

    fn auth_packet(identity: &str, token: &str) -> Packet {
        Packet::new(
            "1",
            AUTH_IDENTIFIER,
            json!({ KEY_AUTH_IDENTIFIER: identity, KEY_TOKEN: token }),
        )
    }

    #[test]
    fn test_accepts_non_empty_credentials() {
        let mut gate = AuthGate::default();
        match gate.evaluate(&auth_packet("user-7", "secret")) {
            AuthOutcome::Accepted { identity, response } => {
                assert_eq!(identity, "user-7");
                let value = response.payload.as_value().unwrap();
                assert_eq!(value[KEY_RESULT], json!(true));
                assert_eq!(value[KEY_AUTH_IDENTIFIER], json!("user-7"));
            }
            other => panic!("expected acceptance, got {:?}", other),
        }
        assert!(gate.is_authenticated());
    }

    #[test]
    fn test_rejects_empty_fields() {
        let mut gate = AuthGate::default();
        match gate.evaluate(&auth_packet("", "secret")) {
            AuthOutcome::Rejected { response } => {
                assert_eq!(response.payload.as_value().unwrap()[KEY_RESULT], json!(false));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert!(!gate.is_authenticated());
    }

    #[test]
    fn test_rejects_non_auth_packet() {
        let mut gate = AuthGate::default();
        let packet = Packet::new("1", "echo.ping", json!("hi"));
        assert!(matches!(gate.evaluate(&packet), AuthOutcome::Rejected { .. }));
    }

    #[test]
    fn test_third_failure_locks_out() {
        let mut gate = AuthGate::default();
        assert!(matches!(
            gate.evaluate(&auth_packet("", "")),
            AuthOutcome::Rejected { .. }
        ));
        assert!(matches!(
            gate.evaluate(&auth_packet("", "")),
            AuthOutcome::Rejected { .. }
        ));
        assert!(matches!(
            gate.evaluate(&auth_packet("", "")),
            AuthOutcome::LockedOut
        ));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let mut gate = AuthGate::default();
        gate.evaluate(&auth_packet("", ""));
        gate.evaluate(&auth_packet("", ""));
        assert!(matches!(
            gate.evaluate(&auth_packet("user-1", "token")),
            AuthOutcome::Accepted { .. }
        ));
    }
}
