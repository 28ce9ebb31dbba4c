//! Transport abstraction for JSON-RPC message streams.
//!
//! A [`Transport`] is the minimal capability set every message carrier in the
//! gateway exposes: start, send one message, close, and three observer slots
//! (inbound message, error, close). Sessions and bridges compose exclusively
//! over this trait, so a stdio child process and an in-process test double are
//! interchangeable.
//!
//! Observer slots are set once while the owning component wires itself up;
//! after that the transport is driven concurrently. Slots are read under a
//! short-lived lock and the handler is invoked with the lock released. Each
//! slot is fired from a single reader task, so handlers are never invoked
//! concurrently for the same slot.

mod json_line;
mod stdio;

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;

use crate::error::TransportError;
use crate::jsonrpc::Message;

pub use json_line::JsonLineFilter;
pub use stdio::{StdioParams, StdioTransport};

/// Callback invoked once per complete inbound message.
pub type MessageHandler = Arc<dyn Fn(Message) + Send + Sync>;

/// Callback invoked for transport-level failures that do not kill the
/// transport. Fatal failures additionally fire the close handler.
pub type ErrorHandler = Arc<dyn Fn(TransportError) + Send + Sync>;

/// Callback invoked exactly once when the transport reaches its terminal
/// state. No message handler fires after it.
pub type CloseHandler = Arc<dyn Fn() + Send + Sync>;

/// The capability contract shared by all transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport. The stdio implementation treats a second start as
    /// a failure with [`TransportError::AlreadyStarted`].
    async fn start(&self) -> Result<(), TransportError>;

    /// Send one message. Concurrent callers must not observe interleaved
    /// bytes of distinct messages.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Close the transport. Idempotent; the close observer fires at most once
    /// over the transport's lifetime.
    async fn close(&self) -> Result<(), TransportError>;

    /// Register the inbound message observer.
    fn on_message(&self, handler: MessageHandler);

    /// Register the error observer.
    fn on_error(&self, handler: ErrorHandler);

    /// Register the close observer.
    fn on_close(&self, handler: CloseHandler);
}

/// The three observer slots shared by transport implementations.
///
/// Handlers are cloned out under the lock and invoked without it, so a
/// handler may re-enter the transport (e.g. call `close`) without deadlock.
#[derive(Default)]
pub(crate) struct Observers {
    message: Mutex<Option<MessageHandler>>,
    error: Mutex<Option<ErrorHandler>>,
    close: Mutex<Option<CloseHandler>>,
}

impl Observers {
    pub(crate) fn set_message(&self, handler: MessageHandler) {
        *lock(&self.message) = Some(handler);
    }

    pub(crate) fn set_error(&self, handler: ErrorHandler) {
        *lock(&self.error) = Some(handler);
    }

    pub(crate) fn set_close(&self, handler: CloseHandler) {
        *lock(&self.close) = Some(handler);
    }

    pub(crate) fn emit_message(&self, message: Message) {
        let handler = lock(&self.message).clone();
        if let Some(handler) = handler {
            handler(message);
        }
    }

    pub(crate) fn emit_error(&self, error: TransportError) {
        let handler = lock(&self.error).clone();
        if let Some(handler) = handler {
            handler(error);
        }
    }

    pub(crate) fn emit_close(&self) {
        let handler = lock(&self.close).clone();
        if let Some(handler) = handler {
            handler();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
