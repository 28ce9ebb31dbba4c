//! HTTP gateway with axum.
//!
//! Exposes the backend over three endpoints: a request/response endpoint
//! (default `/mcp`) that forwards one JSON-RPC message per POST, a DELETE on
//! the same path to terminate a session, and an SSE endpoint (default `/sse`)
//! streaming the session's archived events. CORS and the optional shared-key
//! auth run as a middleware layer in front of all routing; `GET /ping` and
//! CORS preflight bypass auth.
//!
//! # Operating modes
//!
//! Stateful (default): the first `initialize` request creates a session whose
//! id is returned in the `mcp-session-id` header and required on every later
//! request. Stateless: each request spawns and reaps its own backend; no
//! session id is exchanged and events are not retained.

mod auth;

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use bytes::Bytes;
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{GatewayError, TransportError};
use crate::eventstore::{Event, InMemoryEventStore};
use crate::jsonrpc;
use crate::session::{CloseHook, Session, SUBSCRIBER_CAPACITY};
use crate::transport::Transport;

pub use auth::ApiKeyAuth;

/// Header carrying the session id in both directions.
pub const SESSION_ID_HEADER: &str = "mcp-session-id";

/// Standard SSE resumption header honoured by the event stream endpoint.
const LAST_EVENT_ID_HEADER: &str = "last-event-id";

const SSE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Builds a fresh transport for each new session.
pub type TransportFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Transport>, TransportError> + Send + Sync>;

/// Builds the per-session event store (stateful mode only).
pub type EventStoreFactory = Arc<dyn Fn() -> Arc<InMemoryEventStore> + Send + Sync>;

/// Configuration for [`GatewayServer::start`].
#[derive(Clone)]
pub struct GatewayOptions {
    /// Interface to bind, e.g. `0.0.0.0`.
    pub host: String,
    /// Port to bind; `0` picks an ephemeral port.
    pub port: u16,
    /// Shared API key; `None` disables authentication.
    pub api_key: Option<String>,
    /// Path of the request/response endpoint.
    pub stream_endpoint: String,
    /// Path of the SSE event stream endpoint.
    pub sse_endpoint: String,
    /// Spawn one backend per request instead of keeping sessions.
    pub stateless: bool,
    pub transport_factory: TransportFactory,
    pub event_store_factory: Option<EventStoreFactory>,
}

impl GatewayOptions {
    /// Options bound to localhost with default endpoints and an event store.
    pub fn new(transport_factory: TransportFactory) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            api_key: None,
            stream_endpoint: "/mcp".to_string(),
            sse_endpoint: "/sse".to_string(),
            stateless: false,
            transport_factory,
            event_store_factory: Some(Arc::new(|| Arc::new(InMemoryEventStore::new()))),
        }
    }
}

struct GatewayState {
    options: GatewayOptions,
    auth: ApiKeyAuth,
    sessions: DashMap<String, Arc<Session>>,
}

impl GatewayState {
    /// Spawn a transport and bind a new session around it.
    async fn create_session(
        self: &Arc<Self>,
    ) -> Result<(Arc<Session>, String), GatewayError> {
        let transport = (self.options.transport_factory)()?;
        let session_id = Uuid::new_v4().to_string();

        let store = match (&self.options.event_store_factory, self.options.stateless) {
            (Some(factory), false) => Some(factory()),
            _ => None,
        };

        let stateless = self.options.stateless;
        let hook_id = session_id.clone();
        let weak = Arc::downgrade(self);
        let on_close: CloseHook = Box::new(move || {
            if !stateless {
                if let Some(state) = weak.upgrade() {
                    state.sessions.remove(&hook_id);
                }
            }
            tracing::debug!(session_id = %hook_id, "session closed");
        });

        let session = Arc::new(Session::new(
            session_id.clone(),
            transport,
            store,
            Some(on_close),
        ));
        session.start().await?;

        if !stateless {
            self.sessions.insert(session_id.clone(), Arc::clone(&session));
        }
        tracing::debug!(session_id = %session_id, "session connected");

        Ok((session, session_id))
    }

    fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }
}

/// The running HTTP gateway.
pub struct GatewayServer {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    shutdown: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl GatewayServer {
    /// Bind the listener and start serving in a background task.
    pub async fn start(options: GatewayOptions) -> Result<Self, GatewayError> {
        let auth = ApiKeyAuth::new(options.api_key.clone());
        let state = Arc::new(GatewayState {
            auth,
            sessions: DashMap::new(),
            options,
        });

        let app = Router::new()
            .route("/ping", get(handle_ping))
            .route(
                &state.options.stream_endpoint,
                post(handle_post).delete(handle_delete),
            )
            .route(&state.options.sse_endpoint, get(handle_sse))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                cors_and_auth,
            ))
            .with_state(Arc::clone(&state));

        let listener =
            TcpListener::bind((state.options.host.as_str(), state.options.port)).await?;
        let addr = listener.local_addr()?;

        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let serve_task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "http server error");
            }
        });

        tracing::info!(%addr, "gateway listening");
        Ok(Self {
            addr,
            state,
            shutdown,
            serve_task: Mutex::new(Some(serve_task)),
        })
    }

    /// The bound address, useful when port `0` was requested.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Close every live session, then stop the listener.
    pub async fn close(&self) {
        let sessions: Vec<Arc<Session>> = self
            .state
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in sessions {
            if let Err(e) = session.close().await {
                tracing::debug!(error = %e, "session close error during shutdown");
            }
        }

        self.shutdown.cancel();
        let task = self
            .serve_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Middleware
// ─────────────────────────────────────────────────────────────────────────────

/// CORS headers on every response, `204` preflight short-circuit, and the
/// shared-key auth gate. `GET /ping` stays reachable without a key.
async fn cors_and_auth(
    State(state): State<Arc<GatewayState>>,
    request: Request,
    next: Next,
) -> Response {
    let origin = request.headers().get(header::ORIGIN).cloned();

    if request.method() == Method::OPTIONS {
        return with_cors(StatusCode::NO_CONTENT.into_response(), origin);
    }

    let is_ping = request.method() == Method::GET && request.uri().path() == "/ping";
    if !is_ping && !state.auth.validate(request.headers()) {
        return with_cors(state.auth.unauthorized_response(), origin);
    }

    with_cors(next.run(request).await, origin)
}

fn with_cors(mut response: Response, origin: Option<HeaderValue>) -> Response {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        origin.unwrap_or_else(|| HeaderValue::from_static("*")),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS, DELETE"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Content-Type, Authorization, X-API-Key, mcp-session-id"),
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static("mcp-session-id"),
    );
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ping() -> &'static str {
    "pong"
}

async fn handle_post(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let session_id = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let Some(session_id) = session_id else {
        // Only the initial initialize request may arrive without a session id
        // on the stateful endpoint; stateless mode takes everything.
        if !jsonrpc::is_initialize_request(&body) && !state.options.stateless {
            return (StatusCode::BAD_REQUEST, "missing session id").into_response();
        }

        let (session, new_id) = match state.create_session().await {
            Ok(created) => created,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create session");
                return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
            }
        };

        let mut response = request_response(session.request(&body).await);
        if state.options.stateless {
            if let Err(e) = session.close().await {
                tracing::debug!(error = %e, "stateless session close error");
            }
        } else if let Ok(value) = HeaderValue::from_str(&new_id) {
            response.headers_mut().insert(SESSION_ID_HEADER, value);
        }
        return response;
    };

    let Some(session) = state.session(&session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    request_response(session.request(&body).await)
}

/// Map a session request outcome onto an HTTP response.
fn request_response(result: Result<Option<Vec<u8>>, GatewayError>) -> Response {
    match result {
        Ok(Some(body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response(),
        Ok(None) => StatusCode::NO_CONTENT.into_response(),
        Err(e @ GatewayError::InvalidJson(_)) => {
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn handle_delete(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    };

    let Some(session) = state.session(session_id) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    if let Err(e) = session.close().await {
        tracing::debug!(error = %e, "session close error");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn handle_sse(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
) -> Response {
    let Some(session_id) = headers
        .get(SESSION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    else {
        return (StatusCode::BAD_REQUEST, "missing session id").into_response();
    };

    let Some(session) = state.session(session_id) else {
        return (StatusCode::NOT_FOUND, "session not found").into_response();
    };

    // Subscribe before replaying so nothing falls between backlog and live.
    let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
    let unsubscribe = Unsubscribe(Some(session.subscribe(tx)));

    let mut backlog: Vec<Event> = Vec::new();
    if let Some(last_event_id) = headers
        .get(LAST_EVENT_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        session.replay_after(last_event_id, |event| backlog.push(event.clone()));
    }

    let greeting = serde_json::json!({
        "jsonrpc": "2.0",
        "method": "sse/connection",
        "params": { "message": "SSE Connection established" },
    });

    let stream = stream::once(async move {
        Ok::<_, Infallible>(axum::response::sse::Event::default().data(greeting.to_string()))
    })
    .chain(stream::iter(
        backlog.into_iter().map(|event| Ok(sse_event(&event))),
    ))
    .chain(stream::unfold(
        (rx, unsubscribe),
        |(mut rx, unsubscribe)| async move {
            rx.recv()
                .await
                .map(|event| (Ok(sse_event(&event)), (rx, unsubscribe)))
        },
    ));

    Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(SSE_KEEPALIVE_INTERVAL)
                .text("keepalive"),
        )
        .into_response()
}

fn sse_event(event: &Event) -> axum::response::sse::Event {
    let mut out = axum::response::sse::Event::default()
        .data(String::from_utf8_lossy(&event.payload).into_owned());
    if !event.id.is_empty() {
        out = out.id(&event.id);
    }
    out
}

/// Removes an SSE subscriber when its stream is dropped.
struct Unsubscribe<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Unsubscribe<F> {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.0.take() {
            unsubscribe();
        }
    }
}
