//! Bidirectional pairing of two transports with JSON-RPC id namespacing.
//!
//! When both sides of a proxied connection may originate requests, their id
//! spaces can collide. The bridge rewrites every forwarded request id to
//! `proxy-<n>` (a per-direction monotonic counter), remembers the original
//! raw token, and restores it byte-for-byte when the matching response comes
//! back the other way. Notifications and unparseable payloads pass through
//! verbatim.
//!
//! Within one direction, classification and rewriting happen synchronously in
//! the inbound observer and the result is queued onto a single ordered
//! forwarder, so outbound order always matches inbound order.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::value::RawValue;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::jsonrpc::{self, Message};
use crate::transport::Transport;

/// Pending request-id mappings for one direction: `proxy-<n>` → original raw
/// id token.
type IdMap = Arc<DashMap<String, String>>;

/// A pairing of two transports, each relaying into the other.
pub struct Bridge {
    left: Arc<dyn Transport>,
    right: Arc<dyn Transport>,
    started: AtomicBool,
}

impl Bridge {
    /// Pair `left` and `right`, wiring observers on both.
    pub fn new(left: Arc<dyn Transport>, right: Arc<dyn Transport>) -> Self {
        let left_map: IdMap = Arc::new(DashMap::new());
        let right_map: IdMap = Arc::new(DashMap::new());

        let to_right = spawn_forwarder("right", Arc::clone(&right));
        let to_left = spawn_forwarder("left", Arc::clone(&left));

        // Left → right: requests are namespaced via the left map; responses
        // restore ids recorded by right-originated requests.
        {
            let seq = Arc::new(AtomicU64::new(0));
            let request_map = Arc::clone(&left_map);
            let response_map = Arc::clone(&right_map);
            let out = to_right.clone();
            left.on_message(Arc::new(move |message| {
                forward(message, &seq, &request_map, &response_map, &out);
            }));
        }

        // Right → left, mirrored.
        {
            let seq = Arc::new(AtomicU64::new(0));
            let request_map = Arc::clone(&right_map);
            let response_map = Arc::clone(&left_map);
            let out = to_left.clone();
            right.on_message(Arc::new(move |message| {
                forward(message, &seq, &request_map, &response_map, &out);
            }));
        }

        // Errors on one side surface as proxy/error notifications on the
        // other; close on one side closes the other.
        {
            let out = to_right.clone();
            left.on_error(Arc::new(move |error: TransportError| {
                let payload = jsonrpc::bridge_error_notification("left", &error.to_string());
                let _ = out.send(Message::new(&payload));
            }));
        }
        {
            let out = to_left.clone();
            right.on_error(Arc::new(move |error: TransportError| {
                let payload = jsonrpc::bridge_error_notification("right", &error.to_string());
                let _ = out.send(Message::new(&payload));
            }));
        }
        {
            let other = Arc::clone(&right);
            left.on_close(Arc::new(move || {
                let other = Arc::clone(&other);
                tokio::spawn(async move {
                    let _ = other.close().await;
                });
            }));
        }
        {
            let other = Arc::clone(&left);
            right.on_close(Arc::new(move || {
                let other = Arc::clone(&other);
                tokio::spawn(async move {
                    let _ = other.close().await;
                });
            }));
        }

        Self {
            left,
            right,
            started: AtomicBool::new(false),
        }
    }

    /// Start both sides, left first. If the right side fails, the left side
    /// is closed again and the error returned. Subsequent calls are no-ops.
    pub async fn start(&self) -> Result<(), TransportError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.left.start().await?;
        if let Err(e) = self.right.start().await {
            if let Err(close_err) = self.left.close().await {
                tracing::debug!(error = %close_err, "closing left after right start failure");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Close both sides. Closing is best-effort; individual failures are
    /// logged and swallowed.
    pub async fn close(&self) -> Result<(), TransportError> {
        if let Err(e) = self.left.close().await {
            tracing::debug!(error = %e, side = "left", "bridge close error");
        }
        if let Err(e) = self.right.close().await {
            tracing::debug!(error = %e, side = "right", "bridge close error");
        }
        Ok(())
    }
}

/// Single ordered writer towards one transport. Both the message rewriter and
/// the error notifier for a direction feed this queue, so the outbound side
/// observes inbound order.
fn spawn_forwarder(
    side: &'static str,
    to: Arc<dyn Transport>,
) -> mpsc::UnboundedSender<Message> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if let Err(e) = to.send(message).await {
                tracing::debug!(error = %e, side, "bridge forward failed");
            }
        }
    });
    tx
}

/// Classify one inbound envelope and queue the outbound form.
fn forward(
    message: Message,
    seq: &AtomicU64,
    request_map: &DashMap<String, String>,
    response_map: &DashMap<String, String>,
    out: &mpsc::UnboundedSender<Message>,
) {
    let raw = message.bytes();

    // Member values are kept as raw tokens so the rewrite only ever touches
    // the id field.
    let Ok(mut envelope) = serde_json::from_slice::<BTreeMap<String, Box<RawValue>>>(&raw)
    else {
        let _ = out.send(message);
        return;
    };

    let Some(id) = envelope.get("id") else {
        // Notification: no correlation to maintain.
        let _ = out.send(message);
        return;
    };
    let id_token = id.get().to_string();

    if envelope.contains_key("method") {
        // Request: namespace the id.
        let proxy_id = format!("proxy-{}", seq.fetch_add(1, Ordering::SeqCst) + 1);
        let Ok(quoted) = RawValue::from_string(format!("\"{proxy_id}\"")) else {
            return;
        };
        envelope.insert("id".to_string(), quoted);
        request_map.insert(proxy_id.clone(), id_token);

        match serde_json::to_vec(&envelope) {
            Ok(rewritten) => {
                let _ = out.send(Message::new(&rewritten));
            }
            Err(e) => {
                request_map.remove(&proxy_id);
                tracing::debug!(error = %e, "dropping unserializable bridged request");
            }
        }
        return;
    }

    // Response: restore the original id recorded by the opposite direction.
    let Ok(proxy_id) = serde_json::from_str::<String>(&id_token) else {
        let _ = out.send(message);
        return;
    };

    if let Some(original) = response_map.get(&proxy_id).map(|entry| entry.value().clone()) {
        if let Ok(restored) = RawValue::from_string(original) {
            envelope.insert("id".to_string(), restored);
            if let Ok(rewritten) = serde_json::to_vec(&envelope) {
                let _ = out.send(Message::new(&rewritten));
                response_map.remove(&proxy_id);
                return;
            }
        }
    }

    let _ = out.send(message);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::transport::testing::MockTransport;

    async fn wait_for_sent(transport: &MockTransport, count: usize) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let sent = transport.sent();
            if sent.len() >= count {
                return sent;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {count} forwarded messages"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn request_ids_are_namespaced_and_restored() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        bridge.start().await.unwrap();

        left.emit_message(br#"{"jsonrpc":"2.0","method":"initialize","id":"test-123"}"#);

        let forwarded = wait_for_sent(&right, 1).await;
        let parsed: serde_json::Value = serde_json::from_slice(&forwarded[0].bytes()).unwrap();
        let proxy_id = parsed["id"].as_str().unwrap().to_string();
        assert!(proxy_id.starts_with("proxy-"));
        assert_eq!(parsed["jsonrpc"], "2.0");
        assert_eq!(parsed["method"], "initialize");

        // The matching response restores the original id byte-for-byte.
        right.emit_message(
            format!(r#"{{"jsonrpc":"2.0","id":"{proxy_id}","result":{{"ok":true}}}}"#).as_bytes(),
        );
        let returned = wait_for_sent(&left, 1).await;
        let parsed: serde_json::Value = serde_json::from_slice(&returned[0].bytes()).unwrap();
        assert_eq!(parsed["id"], "test-123");
        assert_eq!(parsed["result"]["ok"], true);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn proxy_ids_are_unique_per_direction() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        bridge.start().await.unwrap();

        for i in 0..5 {
            left.emit_message(
                format!(r#"{{"jsonrpc":"2.0","method":"ping","id":{i}}}"#).as_bytes(),
            );
        }

        let forwarded = wait_for_sent(&right, 5).await;
        let mut ids: Vec<String> = forwarded
            .iter()
            .map(|m| {
                let parsed: serde_json::Value = serde_json::from_slice(&m.bytes()).unwrap();
                parsed["id"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(ids, vec!["proxy-1", "proxy-2", "proxy-3", "proxy-4", "proxy-5"]);
        ids.dedup();
        assert_eq!(ids.len(), 5);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn notifications_pass_verbatim() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        bridge.start().await.unwrap();

        let payload = br#"{"jsonrpc":"2.0","method":"notifications/progress","params":{"p":1}}"#;
        left.emit_message(payload);

        let forwarded = wait_for_sent(&right, 1).await;
        assert_eq!(forwarded[0].bytes(), payload);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_json_passes_verbatim() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        bridge.start().await.unwrap();

        left.emit_message(b"definitely not json");

        let forwarded = wait_for_sent(&right, 1).await;
        assert_eq!(forwarded[0].bytes(), b"definitely not json");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_response_id_passes_verbatim() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        bridge.start().await.unwrap();

        let payload = br#"{"jsonrpc":"2.0","id":"proxy-404","result":null}"#;
        right.emit_message(payload);

        let forwarded = wait_for_sent(&left, 1).await;
        assert_eq!(forwarded[0].bytes(), payload);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn errors_surface_on_the_other_side() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        bridge.start().await.unwrap();

        left.emit_error(TransportError::Stderr("left pipe broke".to_string()));

        let forwarded = wait_for_sent(&right, 1).await;
        let parsed: serde_json::Value = serde_json::from_slice(&forwarded[0].bytes()).unwrap();
        assert_eq!(parsed["method"], "proxy/error");
        assert_eq!(parsed["params"]["source"], "left");
        assert_eq!(parsed["params"]["error"], "left pipe broke");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_propagates_to_the_other_side() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        bridge.start().await.unwrap();

        left.close().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !right.is_closed() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "right side never closed"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn right_start_failure_closes_left() {
        let left = MockTransport::new();
        let right = MockTransport::new();
        right.fail_start.store(true, Ordering::SeqCst);

        let bridge = Bridge::new(Arc::clone(&left) as Arc<dyn Transport>, Arc::clone(&right) as Arc<dyn Transport>);
        assert!(bridge.start().await.is_err());
        assert!(left.is_closed());
    }
}
