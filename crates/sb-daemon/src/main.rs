//! shellbridge daemon: serves PTY-backed terminal sessions over HTTP and
//! WebSocket until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sb_bridge::http_api::{api_router, ApiState};
use sb_core::config::{Config, CONFIG_ENV_VAR};
use sb_session::pty::NativePtyBackend;
use sb_session::SessionManager;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// shellbridge -- remote terminal bridge.
#[derive(Parser)]
#[command(name = "shellbridge", version, about)]
struct Cli {
    /// Path to config.toml (defaults to ~/.shellbridge/config.toml).
    #[arg(long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Override the listen host.
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    if let Some(host) = cli.host {
        config.daemon.host = host;
    }
    if let Some(port) = cli.port {
        config.daemon.port = port;
    }

    sb_telemetry::logging::init("shellbridge", &config.logging.level, config.logging.json);
    info!(version = env!("CARGO_PKG_VERSION"), "shellbridge daemon starting");

    let manager = SessionManager::new(Arc::new(NativePtyBackend), config.session.max_sessions);
    let addr = config.daemon.bind_addr();
    let state = Arc::new(ApiState::new(Arc::clone(&manager), config));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("API server: http://{addr}");

    axum::serve(listener, api_router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("API server failed")?;

    info!(sessions = manager.len().await, "closing remaining sessions");
    manager.close_all().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("ctrl-c received, initiating shutdown");
}
