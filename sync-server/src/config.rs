//! Configuration loading for profile-sync-server.
//!
//! Configuration is loaded from a TOML file (default: `profile-sync.toml`).
//! The live configuration is an immutable snapshot behind a [`ConfigHandle`];
//! reloading swaps the whole snapshot at once.

use arc_swap::ArcSwap;
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cleanup::Schedule;

/// Root configuration for profile-sync-server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Storage configuration.
    #[serde(default)]
    pub storage: StorageConfig,
    /// Profile identifier lifecycle configuration.
    #[serde(default)]
    pub identity: IdentityConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Cleanup job configuration.
    #[serde(default)]
    pub cleanup: CleanupConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the HTTP server (default: 0.0.0.0:8080).
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Enable metrics endpoint (default: true).
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

/// Storage configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StorageConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_database_path")]
    pub database: PathBuf,
    /// Maximum sync blob size in bytes (default: 1MB).
    #[serde(default = "default_max_blob_size")]
    pub max_blob_size: usize,
}

/// Profile identifier TTLs in the ephemeral tier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct IdentityConfig {
    /// TTL for identifiers that only exist in the ephemeral tier (default: 30 minutes).
    #[serde(default = "default_ephemeral_ttl")]
    pub ephemeral_ttl_secs: u64,
    /// TTL for the cached projection of a promoted identifier (default: 7 days).
    #[serde(default = "default_promoted_ttl")]
    pub promoted_ttl_secs: u64,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LimitsConfig {
    /// Enable the sliding-window limiter (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Requests allowed per window per principal or address (default: 60).
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    /// Window length in seconds (default: 60).
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Principals that are never limited.
    #[serde(default)]
    pub exempt_principals: Vec<String>,
    /// Roles that are never limited.
    #[serde(default)]
    pub exempt_roles: Vec<String>,
    /// Source addresses or CIDR ranges that are never limited.
    #[serde(default)]
    pub trusted_addresses: Vec<String>,
    /// Budget for the shared-counter round trips before failing open (default: 250ms).
    #[serde(default = "default_backend_timeout_ms")]
    pub backend_timeout_ms: u64,
    /// Process-wide cap across all clients, 0 disables (default: 1000).
    ///
    /// Read once at startup.
    #[serde(default = "default_global_rps")]
    pub global_requests_per_second: u32,
}

/// Cleanup job configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CleanupConfig {
    /// Enable the cleanup job (default: true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// When to run: `@hourly`, `@daily`, `@every 30m`, or seconds (default: `@daily`).
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// Identifiers idle longer than this are stale (default: 90 days).
    #[serde(default = "default_inactivity_window")]
    pub inactivity_window_secs: u64,
    /// Maximum rows handled per scan (default: 500).
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    /// Mark rows deleted instead of removing them (default: false).
    #[serde(default)]
    pub soft_delete: bool,
    /// Also remove identifiers whose account is gone (default: true).
    #[serde(default = "default_true")]
    pub orphan_cleanup: bool,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_true() -> bool {
    true
}

fn default_database_path() -> PathBuf {
    PathBuf::from("profile-sync.db")
}

fn default_max_blob_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_ephemeral_ttl() -> u64 {
    30 * 60
}

fn default_promoted_ttl() -> u64 {
    7 * 24 * 60 * 60
}

fn default_threshold() -> u32 {
    60
}

fn default_window_secs() -> u64 {
    60
}

fn default_backend_timeout_ms() -> u64 {
    250
}

fn default_global_rps() -> u32 {
    1000
}

fn default_schedule() -> String {
    "@daily".to_string()
}

fn default_inactivity_window() -> u64 {
    90 * 24 * 60 * 60
}

fn default_batch_size() -> u32 {
    500
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            metrics_enabled: true,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            max_blob_size: default_max_blob_size(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            ephemeral_ttl_secs: default_ephemeral_ttl(),
            promoted_ttl_secs: default_promoted_ttl(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_threshold(),
            window_secs: default_window_secs(),
            exempt_principals: Vec::new(),
            exempt_roles: Vec::new(),
            trusted_addresses: Vec::new(),
            backend_timeout_ms: default_backend_timeout_ms(),
            global_requests_per_second: default_global_rps(),
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            schedule: default_schedule(),
            inactivity_window_secs: default_inactivity_window(),
            batch_size: default_batch_size(),
            soft_delete: false,
            orphan_cleanup: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig::default(),
            identity: IdentityConfig::default(),
            limits: LimitsConfig::default(),
            cleanup: CleanupConfig::default(),
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or fails validation.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.max_blob_size == 0 {
            return Err(ConfigError::invalid("storage.max_blob_size", "must be > 0"));
        }
        if self.identity.ephemeral_ttl_secs == 0 || self.identity.promoted_ttl_secs == 0 {
            return Err(ConfigError::invalid("identity", "TTLs must be > 0"));
        }
        if self.identity.promoted_ttl_secs < self.identity.ephemeral_ttl_secs {
            return Err(ConfigError::invalid(
                "identity.promoted_ttl_secs",
                "must be >= ephemeral_ttl_secs",
            ));
        }
        if self.limits.threshold == 0 {
            return Err(ConfigError::invalid("limits.threshold", "must be > 0"));
        }
        if self.limits.window_secs == 0 {
            return Err(ConfigError::invalid("limits.window_secs", "must be > 0"));
        }
        self.limits.trusted_networks()?;
        if self.cleanup.batch_size == 0 {
            return Err(ConfigError::invalid("cleanup.batch_size", "must be > 0"));
        }
        if self.cleanup.inactivity_window_secs == 0 {
            return Err(ConfigError::invalid(
                "cleanup.inactivity_window_secs",
                "must be > 0",
            ));
        }
        Schedule::parse(&self.cleanup.schedule)?;
        Ok(())
    }
}

impl LimitsConfig {
    /// Parse `trusted_addresses` into networks. Bare addresses become host routes.
    pub fn trusted_networks(&self) -> Result<Vec<IpNet>, ConfigError> {
        self.trusted_addresses
            .iter()
            .map(|raw| {
                raw.parse::<IpNet>()
                    .or_else(|_| raw.parse::<IpAddr>().map(IpNet::from))
                    .map_err(|_| {
                        ConfigError::invalid(
                            "limits.trusted_addresses",
                            format!("not an address or CIDR: {raw}"),
                        )
                    })
            })
            .collect()
    }
}

/// Shared handle to the current configuration snapshot.
///
/// Cloning the handle is cheap; all clones observe the same swaps.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    inner: Arc<ArcSwap<Config>>,
}

impl ConfigHandle {
    /// Create a handle holding `config`.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    /// Load the current snapshot.
    ///
    /// The returned `Arc` stays consistent even if a reload happens while it is held.
    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    /// Validate and atomically install a new snapshot.
    pub fn replace(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;
        self.inner.store(Arc::new(config));
        Ok(())
    }
}

/// Configuration error types.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// Failed to parse configuration file.
    #[error("failed to parse config file {path}: {source}")]
    ParseError {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying TOML parse error.
        source: toml::de::Error,
    },
    /// A value is out of range or malformed.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the field.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }

    pub(crate) fn bad_schedule(reason: impl Into<String>) -> Self {
        Self::invalid("cleanup.schedule", reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.storage.max_blob_size, 1024 * 1024);
        assert_eq!(config.limits.threshold, 60);
        assert_eq!(config.cleanup.schedule, "@daily");
    }

    #[test]
    fn config_from_toml_string() {
        let toml = r#"
[server]
bind_address = "127.0.0.1:5000"

[storage]
database = "/data/sync.db"
max_blob_size = 2097152

[identity]
ephemeral_ttl_secs = 600

[limits]
threshold = 5
window_secs = 10
exempt_roles = ["admin"]
trusted_addresses = ["10.0.0.0/8", "127.0.0.1"]

[cleanup]
schedule = "@every 30m"
soft_delete = true
"#;

        let config: Config = toml::from_str(toml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.server.bind_address, "127.0.0.1:5000");
        assert_eq!(config.storage.database, PathBuf::from("/data/sync.db"));
        assert_eq!(config.storage.max_blob_size, 2097152);
        assert_eq!(config.identity.ephemeral_ttl_secs, 600);
        assert_eq!(config.limits.threshold, 5);
        assert_eq!(config.limits.exempt_roles, vec!["admin".to_string()]);
        assert_eq!(config.limits.trusted_networks().unwrap().len(), 2);
        assert!(config.cleanup.soft_delete);
    }

    #[test]
    fn config_missing_sections_use_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn rejects_zero_window() {
        let mut config = Config::default();
        config.limits.window_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "limits.window_secs", .. })
        ));
    }

    #[test]
    fn rejects_bad_trusted_address() {
        let mut config = Config::default();
        config.limits.trusted_addresses = vec!["not-an-ip".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_schedule() {
        let mut config = Config::default();
        config.cleanup.schedule = "whenever".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn handle_swaps_snapshot() {
        let handle = ConfigHandle::new(Config::default());
        let before = handle.load();

        let mut next = Config::default();
        next.limits.threshold = 7;
        handle.replace(next).unwrap();

        assert_eq!(before.limits.threshold, 60);
        assert_eq!(handle.load().limits.threshold, 7);
    }

    #[test]
    fn handle_keeps_snapshot_on_invalid_replace() {
        let handle = ConfigHandle::new(Config::default());
        let mut bad = Config::default();
        bad.cleanup.batch_size = 0;
        assert!(handle.replace(bad).is_err());
        assert_eq!(handle.load().cleanup.batch_size, 500);
    }

    #[test]
    fn from_file_reads_and_validates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile-sync.toml");
        std::fs::write(&path, "[limits]\nthreshold = 3\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.limits.threshold, 3);

        let missing = Config::from_file(&dir.path().join("missing.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadError { .. })));
    }
}
