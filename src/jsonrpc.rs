//! Raw JSON-RPC 2.0 envelopes.
//!
//! The gateway never interprets payloads beyond the envelope fields it needs
//! for routing (`id`, `method`, `jsonrpc`). [`Message`] therefore wraps the
//! raw bytes of one JSON value and round-trips them untouched, preserving
//! number precision and key order of whatever the client or backend produced.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};
use serde_json::value::RawValue;

/// One raw JSON-RPC message.
///
/// Construction copies the caller's buffer and [`Message::bytes`] returns a
/// fresh copy, so no caller can alias the internal storage. Serde
/// implementations emit and capture the raw bytes verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    raw: Bytes,
}

impl Message {
    /// Wrap the raw JSON bytes as a `Message`, copying them.
    pub fn new(raw: &[u8]) -> Self {
        Self {
            raw: Bytes::copy_from_slice(raw),
        }
    }

    /// Return a copy of the raw JSON payload.
    pub fn bytes(&self) -> Vec<u8> {
        self.raw.to_vec()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.raw
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw: &RawValue =
            serde_json::from_slice(&self.raw).map_err(serde::ser::Error::custom)?;
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        Ok(Message::new(raw.get().as_bytes()))
    }
}

/// A parsed top-level JSON-RPC object, values kept as raw tokens.
pub(crate) type Envelope<'a> = HashMap<String, &'a RawValue>;

/// Parse the top level of a JSON-RPC message without touching member values.
pub(crate) fn parse_envelope(raw: &[u8]) -> Result<Envelope<'_>, serde_json::Error> {
    serde_json::from_slice(raw)
}

/// Extract the raw JSON token of the `id` field, if present.
///
/// The token is used verbatim as a correlation key, so the numeric id `1` and
/// the string id `"1"` stay distinct as JSON-RPC requires. Returns `None` for
/// notifications and for payloads that are not JSON objects.
pub fn raw_id(raw: &[u8]) -> Option<String> {
    let envelope = parse_envelope(raw).ok()?;
    envelope.get("id").map(|id| id.get().to_string())
}

/// True when the raw message is a JSON-RPC 2.0 `initialize` request.
pub fn is_initialize_request(raw: &[u8]) -> bool {
    #[derive(serde::Deserialize)]
    struct Probe<'a> {
        #[serde(default, borrow)]
        jsonrpc: Option<&'a str>,
        #[serde(default, borrow)]
        method: Option<&'a str>,
    }

    match serde_json::from_slice::<Probe<'_>>(raw) {
        Ok(probe) => probe.method == Some("initialize") && probe.jsonrpc == Some("2.0"),
        Err(_) => false,
    }
}

/// True when the message lacks an `id` field (and so elicits no response).
pub fn is_notification(raw: &[u8]) -> bool {
    match parse_envelope(raw) {
        Ok(envelope) => !envelope.contains_key("id"),
        Err(_) => false,
    }
}

/// Build a `proxy/error` notification carrying a session-level error message.
pub fn error_notification(message: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "proxy/error",
        "params": { "message": message },
    });
    payload.to_string().into_bytes()
}

/// Build a `proxy/error` notification for a bridge side failure.
///
/// `source` names the side the error originated from (`"left"` or `"right"`);
/// the notification is delivered to the opposite side.
pub fn bridge_error_notification(source: &str, error: &str) -> Vec<u8> {
    let payload = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "proxy/error",
        "params": { "source": source, "error": error },
    });
    payload.to_string().into_bytes()
}

/// Build a `proxy/heartbeat` notification stamped with the given instant.
pub fn heartbeat_notification(at: DateTime<Utc>) -> Vec<u8> {
    let payload = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "proxy/heartbeat",
        "params": { "at": at.to_rfc3339_opts(SecondsFormat::Nanos, true) },
    });
    payload.to_string().into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_copies_are_independent() {
        let original = br#"{"jsonrpc":"2.0","id":1}"#;
        let msg = Message::new(original);
        let mut returned = msg.bytes();
        returned[0] = b'X';
        assert_eq!(msg.bytes(), original);

        let second = msg.clone();
        assert_eq!(second.bytes(), original);
    }

    #[test]
    fn message_serde_preserves_raw_bytes() {
        // Number precision and key order survive a round trip.
        let raw = br#"{"b":1,"a":18446744073709551616,"c":1.00}"#;
        let msg = Message::new(raw);

        let serialized = serde_json::to_vec(&msg).unwrap();
        assert_eq!(serialized, raw);

        let deserialized: Message = serde_json::from_slice(raw).unwrap();
        assert_eq!(deserialized.bytes(), raw);
    }

    #[test]
    fn raw_id_distinguishes_number_from_string() {
        assert_eq!(
            raw_id(br#"{"jsonrpc":"2.0","id":1,"method":"x"}"#),
            Some("1".to_string())
        );
        assert_eq!(
            raw_id(br#"{"jsonrpc":"2.0","id":"1","method":"x"}"#),
            Some(r#""1""#.to_string())
        );
        assert_eq!(raw_id(br#"{"jsonrpc":"2.0","method":"x"}"#), None);
        assert_eq!(raw_id(b"not json"), None);
    }

    #[test]
    fn initialize_request_detection() {
        assert!(is_initialize_request(
            br#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#
        ));
        assert!(!is_initialize_request(
            br#"{"jsonrpc":"1.0","id":1,"method":"initialize"}"#
        ));
        assert!(!is_initialize_request(
            br#"{"jsonrpc":"2.0","id":1,"method":"resources/list"}"#
        ));
        assert!(!is_initialize_request(b"garbage"));
    }

    #[test]
    fn notification_detection() {
        assert!(is_notification(
            br#"{"jsonrpc":"2.0","method":"initialized"}"#
        ));
        assert!(!is_notification(br#"{"jsonrpc":"2.0","id":7}"#));
        // Unparseable input is not classified as a notification.
        assert!(!is_notification(b"{"));
    }

    #[test]
    fn synthetic_notifications_are_well_formed() {
        let err = error_notification("boom");
        let parsed: serde_json::Value = serde_json::from_slice(&err).unwrap();
        assert_eq!(parsed["method"], "proxy/error");
        assert_eq!(parsed["params"]["message"], "boom");

        let bridge = bridge_error_notification("left", "pipe broke");
        let parsed: serde_json::Value = serde_json::from_slice(&bridge).unwrap();
        assert_eq!(parsed["params"]["source"], "left");
        assert_eq!(parsed["params"]["error"], "pipe broke");

        let hb = heartbeat_notification(Utc::now());
        let parsed: serde_json::Value = serde_json::from_slice(&hb).unwrap();
        assert_eq!(parsed["method"], "proxy/heartbeat");
        let at = parsed["params"]["at"].as_str().unwrap();
        assert!(at.ends_with('Z'));
    }
}
