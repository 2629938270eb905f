//! MeshSync Daemon
//!
//! Runs one mesh until interrupted.

use clap::Parser;
use meshsync_daemon::{DaemonConfig, MeshService, WgController};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "meshsyncd")]
#[command(about = "MeshSync daemon - keeps a WireGuard mesh in sync with its config file")]
#[command(version)]
struct Cli {
    /// Mesh configuration file
    #[arg(env = "MESHSYNC_CONFIG", default_value = "/etc/meshsync/mesh.yaml")]
    config: PathBuf,

    /// Daemon settings file
    #[arg(long, env = "MESHSYNC_DAEMON_CONFIG", default_value = "/etc/meshsync/meshsyncd.toml")]
    daemon_config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Log as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if cli.json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }

    info!("MeshSync daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = DaemonConfig::load(&cli.daemon_config)?;
    let controller = Arc::new(WgController::new(config.wg_binary.clone()));

    let mut service = MeshService::new(&cli.config, config, controller)?;
    if let Err(e) = service.start().await {
        if !service.is_running() {
            return Err(e.into());
        }
        warn!(error = %e, "Mesh not configured, waiting for config changes");
    }

    info!(config = %cli.config.display(), "Daemon started");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    if let Err(e) = service.shutdown().await {
        error!(error = %e, "Failed to stop mesh");
    }

    info!("Daemon shutdown complete");
    Ok(())
}
