//! # lumen-server
//!
//! Realtime server binary: loads settings, starts the connection manager,
//! and serves HTTP + WebSocket until ctrl-c.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use lumen_realtime::{RealtimeConfig, RealtimeManager};
use lumen_server::logging::init_subscriber;
use lumen_server::metrics::install_recorder;
use lumen_server::server::LumenServer;
use lumen_settings::{LumenSettings, load_settings_from_path, settings_path};

/// How long the HTTP server gets to drain after shutdown is signalled.
const HTTP_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lumen realtime server.
#[derive(Parser, Debug)]
#[command(name = "lumen-server", about = "Lumen realtime connection server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (default: `$LUMEN_SETTINGS` or `~/.lumen/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    fn apply(&self, settings: &mut LumenSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let path = args.settings.clone().unwrap_or_else(settings_path);
    let mut settings = load_settings_from_path(&path)
        .with_context(|| format!("Failed to load settings from {}", path.display()))?;
    args.apply(&mut settings);

    init_subscriber(&settings.logging);
    let metrics = install_recorder().context("Failed to install metrics recorder")?;

    let manager = RealtimeManager::new(RealtimeConfig::from(&settings.realtime))
        .context("Invalid realtime settings")?;
    manager.start();

    let server = LumenServer::new(settings.server, Arc::clone(&manager), metrics);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("Lumen listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown().shutdown();
    manager.shutdown().await;
    if tokio::time::timeout(HTTP_SHUTDOWN_TIMEOUT, handle).await.is_err() {
        tracing::warn!("http server did not stop within {HTTP_SHUTDOWN_TIMEOUT:?}");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
