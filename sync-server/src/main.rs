//! profile-sync binary entry point.
//!
//! Usage:
//! ```bash
//! profile-sync --config profile-sync.toml
//! RUST_LOG=profile_sync_server=debug profile-sync
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use profile_sync_server::clock::{Clock, SystemClock};
use profile_sync_server::config::{Config, ConfigHandle};
use profile_sync_server::ephemeral::{spawn_sweeper, MemoryEphemeralStore};
use profile_sync_server::server::SyncServer;
use profile_sync_server::storage::SqliteStorage;
use profile_sync_server::{cleanup, http};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// How often expired ephemeral keys are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// ETag-gated blob sync server.
#[derive(Parser, Debug)]
#[command(name = "profile-sync")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, short, default_value = "profile-sync.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("Failed to load {}", cli.config.display()))?
    } else {
        tracing::warn!("{} not found, using defaults", cli.config.display());
        Config::default()
    };

    let bind_address: SocketAddr = config
        .server
        .bind_address
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.server.bind_address))?;

    let storage = SqliteStorage::new(&config.storage.database)
        .await
        .context("Failed to open database")?;
    tracing::info!("Database ready at {}", config.storage.database.display());

    let handle = ConfigHandle::new(config);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ephemeral = Arc::new(MemoryEphemeralStore::new(clock.clone()));
    let server = Arc::new(SyncServer::new(
        handle.clone(),
        Arc::new(storage),
        ephemeral.clone(),
        clock,
    ));

    spawn_sweeper(ephemeral, SWEEP_INTERVAL);
    cleanup::spawn_cleanup_task(server.cleanup_job(), server.metrics_arc());
    #[cfg(unix)]
    profile_sync_server::reload::spawn_sighup_handler(cli.config.clone(), handle);

    http::health::init_start_time();
    let app = http::build_router(server);

    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind {bind_address}"))?;
    tracing::info!("profile-sync v{} listening on {}", env!("CARGO_PKG_VERSION"), bind_address);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("HTTP server failed")?;

    tracing::info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
