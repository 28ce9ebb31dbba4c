//! Per-client session: request/response correlation and event fan-out.
//!
//! A session binds one [`Transport`] to the bookkeeping that turns a
//! stream-oriented backend into HTTP request/response semantics: a pending
//! map keyed by the raw JSON token of each request id, a broadcast set of
//! bounded subscriber channels, and an optional [`InMemoryEventStore`] that
//! archives every backend message for resumable replay.
//!
//! The pending map uses the id's raw bytes as the key, so the numeric id `1`
//! and the string id `"1"` correlate independently, as JSON-RPC requires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{GatewayError, TransportError};
use crate::eventstore::{Event, InMemoryEventStore};
use crate::jsonrpc::{self, Message};
use crate::transport::Transport;

/// Bound of each subscriber channel. Fan-out sends are non-blocking; a full
/// subscriber drops events rather than back-pressuring the session.
pub const SUBSCRIBER_CAPACITY: usize = 128;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Hook invoked exactly once when the session reaches its terminal state.
pub type CloseHook = Box<dyn Fn() + Send + Sync>;

struct Shared {
    id: String,
    pending: DashMap<String, oneshot::Sender<Message>>,
    subscribers: Mutex<HashMap<u64, mpsc::Sender<Event>>>,
    next_subscriber: AtomicU64,
    store: Option<Arc<InMemoryEventStore>>,
    cancel: CancellationToken,
    close_hook_fired: AtomicBool,
    on_close: Option<CloseHook>,
}

impl Shared {
    /// Inbound demultiplexer, installed as the transport's message observer.
    fn handle_message(&self, message: Message) {
        if let Some(id_key) = jsonrpc::raw_id(message.as_slice()) {
            if let Some((_, tx)) = self.pending.remove(&id_key) {
                let _ = tx.send(message.clone());
            }
        }

        // Matched or not, every backend message is archived and fanned out.
        self.store_and_broadcast(message.as_slice());
    }

    fn store_and_broadcast(&self, payload: &[u8]) {
        let id = match &self.store {
            Some(store) => store.store(&self.id, payload),
            None => String::new(),
        };
        self.broadcast(Event {
            id,
            stream_id: self.id.clone(),
            payload: Bytes::copy_from_slice(payload),
            timestamp: Utc::now(),
        });
    }

    fn broadcast(&self, event: Event) {
        // Snapshot under the lock, send outside it.
        let snapshot: Vec<(u64, mpsc::Sender<Event>)> = lock(&self.subscribers)
            .iter()
            .map(|(key, tx)| (*key, tx.clone()))
            .collect();

        let mut stale = Vec::new();
        for (key, tx) in snapshot {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(stream_id = %self.id, "subscriber full, dropping event");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stale.push(key),
            }
        }

        if !stale.is_empty() {
            let mut subscribers = lock(&self.subscribers);
            for key in stale {
                subscribers.remove(&key);
            }
        }
    }

    fn fire_close_hook(&self) {
        if self.close_hook_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(hook) = &self.on_close {
            hook();
        }
    }
}

/// One client session over one transport.
pub struct Session {
    shared: Arc<Shared>,
    transport: Arc<dyn Transport>,
}

impl Session {
    /// Create a session and wire its observers onto the transport.
    ///
    /// `on_close` fires exactly once, on explicit [`Session::close`] or when
    /// the underlying transport closes, whichever happens first.
    pub fn new(
        id: String,
        transport: Arc<dyn Transport>,
        store: Option<Arc<InMemoryEventStore>>,
        on_close: Option<CloseHook>,
    ) -> Self {
        let shared = Arc::new(Shared {
            id,
            pending: DashMap::new(),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            store,
            cancel: CancellationToken::new(),
            close_hook_fired: AtomicBool::new(false),
            on_close,
        });

        let on_message = Arc::clone(&shared);
        transport.on_message(Arc::new(move |message| on_message.handle_message(message)));

        let on_error = Arc::clone(&shared);
        transport.on_error(Arc::new(move |error: TransportError| {
            on_error.broadcast(Event {
                id: String::new(),
                stream_id: on_error.id.clone(),
                payload: Bytes::from(jsonrpc::error_notification(&error.to_string())),
                timestamp: Utc::now(),
            });
        }));

        let on_close = Arc::clone(&shared);
        transport.on_close(Arc::new(move || {
            on_close.cancel.cancel();
            // Drop pending senders so blocked `request` callers unblock
            // promptly instead of waiting out their own deadline.
            on_close.pending.clear();
            on_close.fire_close_hook();
        }));

        tokio::spawn(heartbeat_loop(Arc::clone(&shared)));

        Self { shared, transport }
    }

    /// The session id, which doubles as the event stream id.
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Start the underlying transport.
    pub async fn start(&self) -> Result<(), TransportError> {
        self.transport.start().await
    }

    /// Send one payload and, for requests, await the correlated response.
    ///
    /// Notifications (no `id` field) are sent and return `None`. For requests
    /// exactly one of the following happens and the pending entry is cleared
    /// afterwards: the matching response is returned, the send failure is
    /// surfaced, or cancellation is surfaced.
    pub async fn request(&self, payload: &[u8]) -> Result<Option<Vec<u8>>, GatewayError> {
        let id_key = {
            let envelope =
                jsonrpc::parse_envelope(payload).map_err(GatewayError::InvalidJson)?;
            envelope.get("id").map(|id| id.get().to_string())
        };

        let message = Message::new(payload);
        let Some(id_key) = id_key else {
            self.transport.send(message).await?;
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id_key.clone(), tx);
        // Cleared on every exit path, including the caller dropping us.
        let _guard = PendingGuard {
            pending: &self.shared.pending,
            key: id_key,
        };

        self.transport.send(message).await?;

        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(GatewayError::Cancelled),
            response = rx => match response {
                Ok(message) => Ok(Some(message.bytes())),
                Err(_) => Err(GatewayError::Transport(TransportError::Closed)),
            },
        }
    }

    /// Add a subscriber channel to the fan-out set; the returned closure
    /// removes it again.
    pub fn subscribe(&self, tx: mpsc::Sender<Event>) -> impl FnOnce() + Send + 'static {
        let key = self.shared.next_subscriber.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.subscribers).insert(key, tx);

        let shared = Arc::clone(&self.shared);
        move || {
            lock(&shared.subscribers).remove(&key);
        }
    }

    /// Replay stored events after `last_event_id`; no-op without a store.
    pub fn replay_after(&self, last_event_id: &str, visit: impl FnMut(&Event)) -> String {
        match &self.shared.store {
            Some(store) => store.replay_after(last_event_id, visit),
            None => String::new(),
        }
    }

    /// Close the session: cancel its context, fire the close hook once, close
    /// the transport. Safe to call repeatedly.
    pub async fn close(&self) -> Result<(), TransportError> {
        self.shared.cancel.cancel();
        self.shared.fire_close_hook();
        self.transport.close().await
    }
}

struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<Message>>,
    key: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.key);
    }
}

/// Periodic liveness beacon, archived like any backend message so stream
/// consumers can observe gaps. Ends with the session context.
async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    // Consume the immediate first tick; the session just started.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if shared.store.is_some() {
            shared.store_and_broadcast(&jsonrpc::heartbeat_notification(Utc::now()));
        }
    }
}

fn lock<'a>(
    mutex: &'a Mutex<HashMap<u64, mpsc::Sender<Event>>>,
) -> MutexGuard<'a, HashMap<u64, mpsc::Sender<Event>>> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
