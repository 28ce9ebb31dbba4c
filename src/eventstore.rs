//! Append-only in-memory event log with per-stream replay.
//!
//! Every message a backend produces is archived here so a client that drops
//! its event stream can resume: `replay_after` walks all events of the same
//! stream that were inserted strictly after a given event id. Events are
//! never evicted; the log lives as long as the process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// One recorded backend payload.
#[derive(Debug, Clone)]
pub struct Event {
    /// Unique id, prefixed with the stream id so a stray id cannot be
    /// replayed against the wrong stream.
    pub id: String,
    /// The session this event belongs to.
    pub stream_id: String,
    /// Raw payload bytes, copied on insertion.
    pub payload: Bytes,
    /// Wall-clock insertion time.
    pub timestamp: DateTime<Utc>,
}

struct StoredEvent {
    event: Event,
    /// Monotonic insertion counter; replay order is defined by this, not by
    /// the wall clock, so same-millisecond inserts still have a total order.
    seq: u64,
}

/// In-memory [`Event`] store.
///
/// Writers take the lock exclusively; replayers snapshot under a shared lock
/// and iterate outside it, so a long replay never blocks concurrent stores.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: RwLock<HashMap<String, StoredEvent>>,
    seq: AtomicU64,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a payload to the given stream and return the new event id.
    pub fn store(&self, stream_id: &str, payload: &[u8]) -> String {
        let id = format!("{stream_id}_{}", Uuid::new_v4());
        let event = Event {
            id: id.clone(),
            stream_id: stream_id.to_string(),
            payload: Bytes::copy_from_slice(payload),
            timestamp: Utc::now(),
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);

        self.events
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), StoredEvent { event, seq });
        id
    }

    /// Visit every event of the matched stream inserted strictly after
    /// `last_event_id`, in insertion order, and return the stream id.
    ///
    /// An unknown id visits nothing and returns the empty string. The visitor
    /// runs against a snapshot taken at call time; events stored mid-replay
    /// are not observed.
    pub fn replay_after(&self, last_event_id: &str, mut visit: impl FnMut(&Event)) -> String {
        let snapshot = {
            let events = self.events.read().unwrap_or_else(PoisonError::into_inner);

            let Some(anchor) = events.get(last_event_id) else {
                return String::new();
            };
            let stream_id = anchor.event.stream_id.clone();

            let mut stream: Vec<(u64, Event)> = events
                .values()
                .filter(|stored| stored.event.stream_id == stream_id)
                .map(|stored| (stored.seq, stored.event.clone()))
                .collect();
            stream.sort_by_key(|(seq, _)| *seq);
            (stream_id, stream)
        };

        let (stream_id, stream) = snapshot;
        stream
            .iter()
            .skip_while(|(_, event)| event.id != last_event_id)
            .skip(1)
            .for_each(|(_, event)| visit(event));

        stream_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_replay_in_insertion_order() {
        let store = InMemoryEventStore::new();
        let stream = "test-stream";

        let first = store.store(stream, br#"{"seq":1}"#);
        let second = store.store(stream, br#"{"seq":2}"#);
        let third = store.store(stream, br#"{"seq":3}"#);

        assert!(first.starts_with("test-stream_"));

        let mut replayed = Vec::new();
        let matched = store.replay_after(&first, |event| replayed.push(event.clone()));

        assert_eq!(matched, stream);
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].id, second);
        assert_eq!(replayed[0].payload.as_ref(), br#"{"seq":2}"#);
        assert_eq!(replayed[1].id, third);
        assert_eq!(replayed[1].payload.as_ref(), br#"{"seq":3}"#);
    }

    #[test]
    fn unknown_id_visits_nothing() {
        let store = InMemoryEventStore::new();
        store.store("stream", b"{}");

        let matched = store.replay_after("nonexistent", |_| {
            panic!("visitor must not run for an unknown id");
        });
        assert!(matched.is_empty());
    }

    #[test]
    fn replay_from_last_event_is_empty() {
        let store = InMemoryEventStore::new();
        store.store("stream", br#"{"seq":1}"#);
        let last = store.store("stream", br#"{"seq":2}"#);

        let mut count = 0;
        let matched = store.replay_after(&last, |_| count += 1);
        assert_eq!(matched, "stream");
        assert_eq!(count, 0);
    }

    #[test]
    fn streams_are_isolated() {
        let store = InMemoryEventStore::new();
        let anchor = store.store("stream-a", br#"{"stream":"a","seq":1}"#);
        store.store("stream-b", br#"{"stream":"b","seq":1}"#);
        let later = store.store("stream-a", br#"{"stream":"a","seq":2}"#);

        let mut replayed = Vec::new();
        store.replay_after(&anchor, |event| replayed.push(event.clone()));

        assert_eq!(replayed.len(), 1);
        assert_eq!(replayed[0].id, later);
        assert_eq!(replayed[0].stream_id, "stream-a");
    }

    #[test]
    fn stored_payloads_are_copied() {
        let store = InMemoryEventStore::new();
        let mut buffer = br#"{"seq":1}"#.to_vec();
        let id = store.store("stream", &buffer);
        buffer[0] = b'X';

        store.store("stream", b"{}");
        let mut replayed = Vec::new();
        store.replay_after(&id, |event| replayed.push(event.clone()));
        assert_eq!(replayed[0].payload.as_ref(), b"{}");

        // Reverse direction: the anchor's stored payload is intact.
        let events = store.events.read().unwrap();
        assert_eq!(events[&id].event.payload.as_ref(), br#"{"seq":1}"#);
    }

    #[test]
    fn concurrent_stores_are_safe() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryEventStore::new());
        let mut handles = Vec::new();
        for worker in 0..8 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    store.store("shared", format!("{{\"w\":{worker},\"i\":{i}}}").as_bytes());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let events = store.events.read().unwrap();
        assert_eq!(events.len(), 400);
    }
}
