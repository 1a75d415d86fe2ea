use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;

use streamshare_signal::config::{Cli, ServerConfig};
use streamshare_signal::telemetry::Telemetry;
use streamshare_signal::{router, SessionRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::try_from(Cli::parse())?;
    let telemetry = Telemetry::init(&config)?;
    info!(
        listen_addr = %config.listen_addr,
        otel_stdout = config.otel_stdout,
        "starting streamshare signaling server"
    );

    let registry = SessionRegistry::new();
    let app = router(registry.clone(), Some(telemetry.metrics_handle()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("streamshare-signal listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    let stats = registry.stats();
    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        connections = stats.connections,
        sessions = stats.sessions,
        "shutdown signal received; draining"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
