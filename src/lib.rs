//! streamgate — HTTP/SSE gateway for stdio-based JSON-RPC (MCP) servers.
//!
//! The gateway bridges HTTP clients of a JSON-RPC protocol to backend servers
//! speaking the same protocol over a child process's stdin/stdout. Each
//! client session owns one child: requests posted over HTTP are forwarded
//! across stdin and correlated with stdout responses by JSON-RPC id, while
//! every backend message is archived in an in-memory event log so a dropped
//! SSE stream can be resumed.
//!
//! # Components
//!
//! - [`jsonrpc`]: raw message envelopes, preserved byte-for-byte
//! - [`transport`]: the start/send/close + observers contract, its stdio
//!   implementation, and the newline-JSON filter
//! - [`eventstore`]: append-only per-stream event log with replay
//! - [`session`]: request/response correlation and subscriber fan-out
//! - [`bridge`]: pairing of two transports with id namespacing
//! - [`server`]: the axum HTTP/SSE front end

pub mod bridge;
pub mod cli;
pub mod error;
pub mod eventstore;
pub mod jsonrpc;
pub mod server;
pub mod session;
pub mod transport;
