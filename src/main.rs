//! Tokenscope - token launch watcher.
//!
//! ## Configuration
//!
//! - `TOKENSCOPE_CONFIG`: path to the TOML config (default: "config/tokenscope.toml")
//! - `RUST_LOG`: logging level (default: "info")
//!
//! Exits with status 1 when the feed connection is lost for good.

use std::sync::Arc;
use tokenscope::source::WsTransport;
use tokenscope::status::{self, AppState};
use tokenscope::{EventSource, Pipeline, PipelineError, ShutdownSignal, TokenscopeConfig};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = TokenscopeConfig::load()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        feed = %config.feed.url,
        "Tokenscope starting"
    );

    let pipeline = Pipeline::from_config(&config);
    let source = EventSource::from_config(&config.feed, Arc::new(WsTransport::new()));

    let shutdown = ShutdownSignal::with_timeout(config.server.shutdown_timeout());

    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait_for_signal().await });

    let state = AppState::new(Arc::clone(&pipeline), source.stats())
        .with_api_key(config.server.api_key.clone());
    let port = config.server.port;
    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        if let Err(e) = status::serve(port, state, server_shutdown).await {
            error!(error = %e, port, "Status server failed");
        }
    });

    let result = pipeline.run(source, shutdown.clone()).await;

    // The server may still be up if the pipeline stopped on its own.
    shutdown.trigger();
    if let Err(e) = server.await {
        error!(error = %e, "Status server task failed");
    }

    match result {
        Ok(()) => {
            info!("Tokenscope stopped");
            Ok(())
        }
        Err(PipelineError::Source(e)) => {
            error!(error = %e, "Feed lost, exiting");
            std::process::exit(1);
        }
        Err(e) => Err(Box::new(e) as Box<dyn std::error::Error>),
    }
}
