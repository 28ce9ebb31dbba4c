//! Error types for the gateway and its transports.
//!
//! `TransportError` covers failures at the transport boundary: process spawn,
//! stdin writes, double-start, and stderr diagnostics surfaced by the child.
//! `GatewayError` covers the request path: malformed payloads, cancellation,
//! and transport failures bubbling up into HTTP handlers.

use std::io;

/// Errors raised by a [`Transport`](crate::transport::Transport)
/// implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// `start` was called on a transport that is already running.
    #[error("already started")]
    AlreadyStarted,

    /// The child process could not be spawned.
    #[error("failed to spawn {command}: {source}")]
    Spawn {
        /// The command that failed to launch.
        command: String,
        /// The underlying OS error.
        source: io::Error,
    },

    /// `send` was called before `start`, or after the stdin pipe was torn down.
    #[error("stdin not initialized")]
    StdinUnavailable,

    /// The transport has been closed; no further sends will succeed.
    #[error("transport closed")]
    Closed,

    /// A line the child wrote to stderr, surfaced verbatim.
    #[error("{0}")]
    Stderr(String),

    /// An underlying IO error on one of the child's pipes.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors surfaced to HTTP callers by the session layer.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// The request body is not a JSON object.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),

    /// The caller's context or the session was cancelled mid-request.
    #[error("request cancelled")]
    Cancelled,

    /// A transport-level failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The HTTP listener could not be set up.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
