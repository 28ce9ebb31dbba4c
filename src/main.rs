//! streamgate entry point.
//!
//! Parses the CLI, wires a stdio transport factory for the configured backend
//! command, starts the HTTP gateway, and shuts it down on SIGINT/SIGTERM.

use std::sync::Arc;

use clap::Parser;

use streamgate::cli::Cli;
use streamgate::eventstore::InMemoryEventStore;
use streamgate::server::{
    EventStoreFactory, GatewayOptions, GatewayServer, TransportFactory,
};
use streamgate::transport::{StdioTransport, Transport};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let params = match cli.stdio_params() {
        Ok(params) => params,
        Err(message) => {
            eprintln!("streamgate: {message}");
            std::process::exit(2);
        }
    };
    tracing::debug!(
        command = %params.command,
        args = ?params.args,
        stateless = cli.stateless,
        "configured backend"
    );

    let transport_factory: TransportFactory = Arc::new(move || {
        let transport: Arc<dyn Transport> = Arc::new(StdioTransport::new(params.clone()));
        Ok(transport)
    });
    let event_store_factory: EventStoreFactory =
        Arc::new(|| Arc::new(InMemoryEventStore::new()));

    let options = GatewayOptions {
        host: cli.host,
        port: cli.port,
        api_key: cli.api_key,
        stream_endpoint: cli.stream_endpoint,
        sse_endpoint: cli.sse_endpoint,
        stateless: cli.stateless,
        transport_factory,
        event_store_factory: Some(event_store_factory),
    };

    let server = match GatewayServer::start(options).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!(error = %e, "failed to start gateway");
            eprintln!("streamgate: {e}");
            std::process::exit(1);
        }
    };

    wait_for_shutdown().await;
    tracing::info!("shutting down");
    server.close().await;
}

/// Initialise tracing subscriber with stderr output.
///
/// When `verbose` is true, sets filter to `debug`. Otherwise, respects the
/// `RUST_LOG` environment variable (defaulting to no output).
fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            let _ = ctrl_c.await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
