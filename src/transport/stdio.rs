//! Transport backed by a spawned child process speaking NDJSON on stdio.
//!
//! The child reads one JSON-RPC message per line on stdin and writes one per
//! line on stdout. Stdout passes through the [`JsonLineFilter`] so debug
//! chatter is dropped before it reaches the message observer; stderr lines are
//! surfaced verbatim through the error observer; a waiter task turns child
//! exit into the close routine.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::jsonrpc::Message;

use super::json_line::JsonLineFilter;
use super::{CloseHandler, ErrorHandler, MessageHandler, Observers, Transport};

/// Launch parameters for a stdio child process.
#[derive(Debug, Clone, Default)]
pub struct StdioParams {
    /// Program to execute.
    pub command: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
    /// Working directory; inherits the gateway's when unset.
    pub cwd: Option<PathBuf>,
    /// `KEY=VALUE` pairs layered on top of the inherited environment.
    pub env: Vec<(String, String)>,
}

struct Inner {
    params: StdioParams,
    observers: Observers,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    started: AtomicBool,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl Inner {
    /// Terminal transition, entered from external `close`, child exit, or
    /// drop of the last pipe. Runs at most once.
    async fn close_now(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Unblock any in-flight send before tearing down stdin.
        self.shutdown.cancel();
        self.stdin.lock().await.take();
        self.observers.emit_close();
    }
}

/// A [`Transport`] that supervises one child process.
pub struct StdioTransport {
    inner: Arc<Inner>,
}

impl StdioTransport {
    pub fn new(params: StdioParams) -> Self {
        Self {
            inner: Arc::new(Inner {
                params,
                observers: Observers::default(),
                stdin: tokio::sync::Mutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    fn spawn_failure(&self, reason: &str) -> TransportError {
        TransportError::Spawn {
            command: self.inner.params.command.clone(),
            source: std::io::Error::other(reason.to_string()),
        }
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn start(&self) -> Result<(), TransportError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyStarted);
        }

        let params = &self.inner.params;
        let mut cmd = Command::new(&params.command);
        cmd.args(&params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &params.cwd {
            cmd.current_dir(dir);
        }
        for (key, value) in &params.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            command: params.command.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| self.spawn_failure("failed to capture child stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| self.spawn_failure("failed to capture child stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| self.spawn_failure("failed to capture child stderr"))?;

        tracing::info!(
            command = %params.command,
            pid = child.id(),
            "child process spawned"
        );

        *self.inner.stdin.lock().await = Some(stdin);

        // Stdout reader: JSON lines become messages, read errors are reported
        // and end the loop. EOF is left for the waiter to handle.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut filter = JsonLineFilter::new(BufReader::new(stdout));
            loop {
                match filter.next_line().await {
                    Ok(Some(line)) => inner.observers.emit_message(Message::new(&line)),
                    Ok(None) => {
                        tracing::debug!("child stdout closed");
                        break;
                    }
                    Err(e) => {
                        inner.observers.emit_error(TransportError::Io(e));
                        break;
                    }
                }
            }
        });

        // Stderr reader: every line surfaces as a transport error.
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                inner.observers.emit_error(TransportError::Stderr(line));
            }
        });

        // Waiter: owns the child; reaps it on exit or kills it on close.
        let inner = Arc::clone(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            wait_child(&mut child, shutdown).await;
            inner.close_now().await;
        });

        Ok(())
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }

        let mut guard = tokio::select! {
            guard = self.inner.stdin.lock() => guard,
            _ = self.inner.shutdown.cancelled() => return Err(TransportError::Closed),
        };
        let stdin = guard.as_mut().ok_or(TransportError::StdinUnavailable)?;

        // One buffer, one write: concurrent senders queue on the stdin lock
        // and never interleave bytes of distinct messages.
        let mut data = message.bytes();
        data.push(b'\n');

        let write = async {
            stdin.write_all(&data).await?;
            stdin.flush().await
        };
        tokio::select! {
            result = write => result.map_err(TransportError::Io),
            _ = self.inner.shutdown.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.inner.close_now().await;
        Ok(())
    }

    fn on_message(&self, handler: MessageHandler) {
        self.inner.observers.set_message(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.inner.observers.set_error(handler);
    }

    fn on_close(&self, handler: CloseHandler) {
        self.inner.observers.set_close(handler);
    }
}

async fn wait_child(child: &mut Child, shutdown: CancellationToken) {
    tokio::select! {
        status = child.wait() => {
            tracing::debug!(status = ?status.ok(), "child process exited");
        }
        _ = shutdown.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "kill after close failed");
            }
            let _ = child.wait().await;
        }
    }
}
