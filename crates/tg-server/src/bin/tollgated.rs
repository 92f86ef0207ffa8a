use anyhow::{Context, Result};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tg_core::TollgateConfig;
use tg_server::{app_with_state, state::AppState};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = match std::env::var("TOLLGATE_CONFIG") {
        Ok(path) => TollgateConfig::load(&path).with_context(|| format!("Failed to load config from {path}"))?,
        Err(_) => TollgateConfig::default(),
    };
    let addr: SocketAddr = match std::env::var("TOLLGATE_ADDR") {
        Ok(addr) => addr.parse().with_context(|| format!("Invalid TOLLGATE_ADDR: {addr}"))?,
        Err(_) => format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .context("Invalid server host/port")?,
    };

    let state = AppState::new(config);
    let sweeper = state.registry.spawn_sweeper();
    let app = app_with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "Starting server");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    sweeper.shutdown().await;
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
