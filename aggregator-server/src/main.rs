//! Run the aggregator: HTTP ingestion, durable queue, and the idempotent
//! worker pool, all in one process.

use aggregator::config::Config;
use aggregator::server::serve;
use envconfig::Envconfig;
use eyre::Result;
use tokio::signal;

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("shutting down gracefully...");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let listener = tokio::net::TcpListener::bind(config.address).await?;
    serve(config, listener, shutdown()).await;

    Ok(())
}
