//! Shared server state.
//!
//! `SyncServer` wires the durable store, the ephemeral store and the clock
//! into the coordinator, identity lifecycle and rate limiter, and owns the
//! operational counters.

use crate::cleanup::CleanupJob;
use crate::clock::Clock;
use crate::config::{Config, ConfigHandle};
use crate::coordinator::SyncCoordinator;
use crate::ephemeral::EphemeralStore;
use crate::identity::IdentityLifecycle;
use crate::limits::RateLimiter;
use crate::storage::SqliteStorage;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

/// Operational metrics for monitoring server activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct ServerMetrics {
    /// Sync reads that returned a body.
    pub reads_total: AtomicU64,
    /// Sync reads answered with 304.
    pub not_modified_total: AtomicU64,
    /// Successful sync writes.
    pub writes_total: AtomicU64,
    /// Conditional writes rejected with 412.
    pub conflicts_total: AtomicU64,
    /// Blob bytes accepted by writes.
    pub bytes_received: AtomicU64,
    /// Blob bytes returned by reads.
    pub bytes_sent: AtomicU64,
    /// Profile identifier lookups served.
    pub profile_lookups_total: AtomicU64,
    /// Background promotions that failed.
    pub promotion_failures: AtomicU64,
    /// Requests rejected by the rate limiter.
    pub rate_limit_hits: AtomicU64,
    /// Requests that ended in a server-side error.
    pub errors_total: AtomicU64,
    /// Identifier rows removed or marked by cleanup.
    pub identifiers_cleaned: AtomicU64,
    /// Failed cleanup scans or deletes.
    pub cleanup_errors: AtomicU64,
}

/// Main server state, shared by every request handler.
pub struct SyncServer {
    config: ConfigHandle,
    clock: Arc<dyn Clock>,
    storage: Arc<SqliteStorage>,
    coordinator: SyncCoordinator,
    identity: IdentityLifecycle,
    limiter: RateLimiter,
    metrics: Arc<ServerMetrics>,
}

impl std::fmt::Debug for SyncServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncServer")
            .field("storage", &self.storage)
            .field("limiter", &self.limiter)
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

impl SyncServer {
    /// Create the server state.
    ///
    /// `storage` backs both the blob table and the account directory.
    pub fn new(
        config: ConfigHandle,
        storage: Arc<SqliteStorage>,
        ephemeral: Arc<dyn EphemeralStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let coordinator = SyncCoordinator::new(storage.clone(), clock.clone(), config.clone());
        let identity = IdentityLifecycle::new(
            ephemeral.clone(),
            storage.clone(),
            storage.clone(),
            clock.clone(),
            config.clone(),
        );
        let limiter = RateLimiter::new(ephemeral, clock.clone(), config.clone());
        Self {
            config,
            clock,
            storage,
            coordinator,
            identity,
            limiter,
            metrics: Arc::new(ServerMetrics::default()),
        }
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Arc<Config> {
        self.config.load()
    }

    /// Handle used to reload configuration.
    pub fn config_handle(&self) -> &ConfigHandle {
        &self.config
    }

    /// Get access to the storage layer.
    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    /// The blob sync protocol.
    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.coordinator
    }

    /// The profile identifier lifecycle.
    pub fn identity(&self) -> &IdentityLifecycle {
        &self.identity
    }

    /// The request rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &ServerMetrics {
        &self.metrics
    }

    /// Shared handle to the metrics for background tasks.
    pub fn metrics_arc(&self) -> Arc<ServerMetrics> {
        self.metrics.clone()
    }

    /// Build a cleanup job over this server's identity lifecycle.
    pub fn cleanup_job(&self) -> CleanupJob {
        CleanupJob::new(self.identity.clone(), self.clock.clone(), self.config.clone())
    }
}
