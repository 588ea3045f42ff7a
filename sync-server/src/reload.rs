//! SIGHUP-driven configuration reload.
//!
//! On each SIGHUP the config file is re-read, validated and swapped into the
//! [`ConfigHandle`]. A bad file leaves the running config untouched.

use crate::config::{Config, ConfigError, ConfigHandle};
use std::path::{Path, PathBuf};

/// Spawn a task that reloads `config_path` into `handle` on every SIGHUP.
#[cfg(unix)]
pub fn spawn_sighup_handler(config_path: PathBuf, handle: ConfigHandle) {
    tokio::spawn(async move {
        let mut signal = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to install SIGHUP handler: {}", e);
                return;
            }
        };

        tracing::info!("Config reload on SIGHUP enabled ({})", config_path.display());

        loop {
            signal.recv().await;
            tracing::info!("Received SIGHUP, reloading {}", config_path.display());
            match reload_config(&config_path, &handle) {
                Ok(true) => tracing::info!("Configuration updated"),
                Ok(false) => tracing::info!("Configuration unchanged"),
                Err(e) => tracing::warn!("Reload failed, keeping current config: {}", e),
            }
        }
    });
}

/// Read, validate and install the config at `config_path`.
///
/// Returns whether the new config differs from the running one.
pub fn reload_config(config_path: &Path, handle: &ConfigHandle) -> Result<bool, ConfigError> {
    let next = Config::from_file(config_path)?;
    let current = handle.load();
    let changed = *current != next;
    if changed {
        if current.server.bind_address != next.server.bind_address
            || current.storage.database != next.storage.database
        {
            tracing::warn!("bind_address and database changes take effect on restart");
        }
        handle.replace(next)?;
    }
    Ok(changed)
}
