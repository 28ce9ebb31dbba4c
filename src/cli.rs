//! CLI argument types for the `streamgate` binary.
//!
//! Defined separately from `main.rs` so tests can construct them directly.

use std::path::PathBuf;

use clap::Parser;

use crate::transport::StdioParams;

/// HTTP/SSE gateway for stdio-based JSON-RPC (MCP) servers.
#[derive(Parser, Debug, Clone)]
#[command(name = "streamgate", version)]
pub struct Cli {
    /// Host interface to bind the HTTP server.
    #[arg(long, env = "STREAMGATE_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP server.
    #[arg(short, long, env = "STREAMGATE_PORT", default_value_t = 3000)]
    pub port: u16,

    /// Optional API key required for incoming requests.
    #[arg(long, env = "STREAMGATE_API_KEY")]
    pub api_key: Option<String>,

    /// Command to launch the backend server over stdio.
    #[arg(long)]
    pub command: String,

    /// Comma-separated list of extra arguments for the command.
    #[arg(long, default_value = "")]
    pub args: String,

    /// Working directory for the launched command.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Comma-separated KEY=VALUE pairs added to the child environment.
    #[arg(long, default_value = "")]
    pub env: String,

    /// Spawn a fresh backend per request instead of keeping sessions.
    #[arg(long)]
    pub stateless: bool,

    /// Path of the request/response endpoint.
    #[arg(long, default_value = "/mcp")]
    pub stream_endpoint: String,

    /// Path of the SSE event stream endpoint.
    #[arg(long, default_value = "/sse")]
    pub sse_endpoint: String,

    /// Enable debug logging.
    #[arg(long)]
    pub verbose: bool,
}

impl Cli {
    /// Build the child launch parameters from `--command`, `--args`, `--cwd`
    /// and `--env`.
    ///
    /// The command string is whitespace-split; the first token is the program
    /// and the remainder precede anything given via `--args`.
    pub fn stdio_params(&self) -> Result<StdioParams, String> {
        let mut tokens = self.command.split_whitespace();
        let Some(command) = tokens.next() else {
            return Err("--command is empty".to_string());
        };

        let mut args: Vec<String> = tokens.map(str::to_string).collect();
        args.extend(split_comma_list(&self.args));

        Ok(StdioParams {
            command: command.to_string(),
            args,
            cwd: self.cwd.clone(),
            env: split_env_pairs(&self.env),
        })
    }
}

/// Split a comma-separated flag value, trimming entries and dropping blanks.
pub fn split_comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse comma-separated `KEY=VALUE` pairs; entries without `=` are dropped.
pub fn split_env_pairs(value: &str) -> Vec<(String, String)> {
    split_comma_list(value)
        .into_iter()
        .filter_map(|pair| {
            pair.split_once('=')
                .map(|(key, val)| (key.to_string(), val.to_string()))
        })
        .collect()
}
