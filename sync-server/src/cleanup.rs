//! Background cleanup of stale and orphaned profile identifiers.
//!
//! Each run removes at most `batch_size` stale rows and `batch_size` orphaned
//! rows. A failing scan or delete is logged and counted, and the run moves on.

use crate::clock::Clock;
use crate::config::{ConfigError, ConfigHandle};
use crate::identity::{DeletionMode, IdentityLifecycle};
use crate::server::ServerMetrics;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// How often the cleanup job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    every: Duration,
}

impl Schedule {
    /// Parse `@hourly`, `@daily`, `@weekly`, `@every <n><s|m|h|d>`, or a bare
    /// number of seconds.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        let secs = match raw {
            "@hourly" => 60 * 60,
            "@daily" => 24 * 60 * 60,
            "@weekly" => 7 * 24 * 60 * 60,
            _ => match raw.strip_prefix("@every") {
                Some(rest) => parse_duration(rest.trim())?,
                None => raw
                    .parse::<u64>()
                    .map_err(|_| ConfigError::bad_schedule(format!("unrecognised schedule: {raw}")))?,
            },
        };
        if secs == 0 {
            return Err(ConfigError::bad_schedule("interval must be > 0"));
        }
        Ok(Self {
            every: Duration::from_secs(secs),
        })
    }

    /// Time between runs.
    pub fn interval(&self) -> Duration {
        self.every
    }
}

fn parse_duration(raw: &str) -> Result<u64, ConfigError> {
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .map_err(|_| ConfigError::bad_schedule(format!("bad interval: {raw}")))?;
    let scale = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 60 * 60,
        "d" => 24 * 60 * 60,
        other => {
            return Err(ConfigError::bad_schedule(format!("unknown unit: {other}")));
        }
    };
    value
        .checked_mul(scale)
        .ok_or_else(|| ConfigError::bad_schedule(format!("interval overflows: {raw}")))
}

/// Totals from one cleanup run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Stale rows removed or marked.
    pub stale_cleaned: u64,
    /// Orphaned rows removed or marked.
    pub orphans_cleaned: u64,
    /// Scans or deletes that failed.
    pub errors: u32,
}

/// One pass of stale and orphan cleanup.
#[derive(Debug, Clone)]
pub struct CleanupJob {
    identity: IdentityLifecycle,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
}

impl CleanupJob {
    /// Create a job over `identity`.
    pub fn new(identity: IdentityLifecycle, clock: Arc<dyn Clock>, config: ConfigHandle) -> Self {
        Self {
            identity,
            clock,
            config,
        }
    }

    /// Run one pass with the current config snapshot.
    ///
    /// Returns an empty report when cleanup is disabled.
    pub async fn run_once(&self) -> CleanupReport {
        let config = self.config.load();
        let cleanup = &config.cleanup;
        let mut report = CleanupReport::default();

        if !cleanup.enabled {
            tracing::debug!("Cleanup disabled, skipping run");
            return report;
        }

        let mode = if cleanup.soft_delete {
            DeletionMode::Soft
        } else {
            DeletionMode::Hard
        };
        let window = i64::try_from(cleanup.inactivity_window_secs).unwrap_or(i64::MAX);
        let cutoff = self.clock.now_secs().saturating_sub(window);

        match self.identity.find_stale(cutoff, cleanup.batch_size).await {
            Ok(rows) if rows.is_empty() => tracing::debug!("Cleanup: no stale identifiers"),
            Ok(rows) => match self.identity.remove_batch(&rows, mode).await {
                Ok(n) => report.stale_cleaned = n,
                Err(e) => {
                    tracing::error!("Cleanup: deleting {} stale identifiers failed: {}", rows.len(), e);
                    report.errors += 1;
                }
            },
            Err(e) => {
                tracing::error!("Cleanup: stale scan failed: {}", e);
                report.errors += 1;
            }
        }

        if cleanup.orphan_cleanup {
            match self.identity.find_orphaned(cleanup.batch_size).await {
                Ok(rows) if rows.is_empty() => tracing::debug!("Cleanup: no orphaned identifiers"),
                Ok(rows) => match self.identity.remove_batch(&rows, mode).await {
                    Ok(n) => report.orphans_cleaned = n,
                    Err(e) => {
                        tracing::error!(
                            "Cleanup: deleting {} orphaned identifiers failed: {}",
                            rows.len(),
                            e
                        );
                        report.errors += 1;
                    }
                },
                Err(e) => {
                    tracing::error!("Cleanup: orphan scan failed: {}", e);
                    report.errors += 1;
                }
            }
        }

        tracing::info!(
            "Cleanup: {} stale, {} orphaned, {} errors ({:?})",
            report.stale_cleaned,
            report.orphans_cleaned,
            report.errors,
            mode
        );
        report
    }
}

/// Spawn a background cleanup task.
///
/// The schedule is read once here. Returns a handle that can be used to abort the task.
pub fn spawn_cleanup_task(
    job: CleanupJob,
    metrics: Arc<ServerMetrics>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let config = job.config.load();
        if !config.cleanup.enabled {
            tracing::info!("Cleanup task disabled");
            return;
        }

        let schedule = match Schedule::parse(&config.cleanup.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::error!("Cleanup task not started: {}", e);
                return;
            }
        };
        tracing::info!(
            "Cleanup task started (every {}s)",
            schedule.interval().as_secs()
        );

        let mut timer = interval(schedule.interval());
        // First tick fires immediately.
        timer.tick().await;

        loop {
            timer.tick().await;
            let report = job.run_once().await;
            metrics
                .identifiers_cleaned
                .fetch_add(report.stale_cleaned + report.orphans_cleaned, Ordering::Relaxed);
            metrics
                .cleanup_errors
                .fetch_add(u64::from(report.errors), Ordering::Relaxed);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::ephemeral::MemoryEphemeralStore;
    use crate::error::StorageError;
    use crate::storage::{AccountDirectory, IdentifierStore, SqliteStorage};
    use async_trait::async_trait;
    use sync_types::{OwnerKey, ProfileId};

    const DAY: u64 = 24 * 60 * 60;

    #[derive(Debug)]
    struct BrokenDirectory;

    #[async_trait]
    impl AccountDirectory for BrokenDirectory {
        async fn account_exists(&self, _owner: &OwnerKey) -> Result<bool, StorageError> {
            Err(StorageError::Database(sqlx::Error::PoolTimedOut))
        }
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        storage: Arc<SqliteStorage>,
        handle: ConfigHandle,
        job: CleanupJob,
    }

    async fn fixture_with(config: Config, accounts: Option<Arc<dyn AccountDirectory>>) -> Fixture {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let handle = ConfigHandle::new(config);
        let accounts = accounts.unwrap_or_else(|| storage.clone() as Arc<dyn AccountDirectory>);
        let identity = IdentityLifecycle::new(
            Arc::new(MemoryEphemeralStore::new(clock.clone())),
            storage.clone(),
            accounts,
            clock.clone(),
            handle.clone(),
        );
        let job = CleanupJob::new(identity, clock.clone(), handle.clone());
        Fixture {
            clock,
            storage,
            handle,
            job,
        }
    }

    fn cleanup_config(soft_delete: bool, orphan_cleanup: bool) -> Config {
        let mut config = Config::default();
        config.cleanup.inactivity_window_secs = 30 * DAY;
        config.cleanup.soft_delete = soft_delete;
        config.cleanup.orphan_cleanup = orphan_cleanup;
        config
    }

    async fn seed(f: &Fixture, key: &str, idle_days: u64, with_account: bool) {
        let owner = OwnerKey::new(key).unwrap();
        let now = f.clock.now_secs();
        if with_account {
            f.storage.create_account(&owner, now).await.unwrap();
        }
        let row = f
            .storage
            .insert_identifier(&owner, &ProfileId::random(), now)
            .await
            .unwrap();
        f.storage
            .set_last_activity(row.id, now - (idle_days * DAY) as i64)
            .await
            .unwrap();
    }

    #[test]
    fn schedule_parses_known_forms() {
        assert_eq!(Schedule::parse("@hourly").unwrap().interval(), Duration::from_secs(3600));
        assert_eq!(Schedule::parse("@daily").unwrap().interval(), Duration::from_secs(DAY));
        assert_eq!(Schedule::parse("@every 30m").unwrap().interval(), Duration::from_secs(1800));
        assert_eq!(Schedule::parse("@every 2h").unwrap().interval(), Duration::from_secs(7200));
        assert_eq!(Schedule::parse("@every 45").unwrap().interval(), Duration::from_secs(45));
        assert_eq!(Schedule::parse("900").unwrap().interval(), Duration::from_secs(900));
    }

    #[test]
    fn schedule_rejects_garbage() {
        for raw in ["", "daily", "@every", "@every 5w", "@every 0s", "0", "* * * * *"] {
            assert!(Schedule::parse(raw).is_err(), "{raw:?} should be rejected");
        }
    }

    #[tokio::test]
    async fn run_removes_stale_and_keeps_fresh() {
        let f = fixture_with(cleanup_config(false, false), None).await;
        seed(&f, "idle", 45, true).await;
        seed(&f, "busy", 1, true).await;

        let report = f.job.run_once().await;
        assert_eq!(
            report,
            CleanupReport {
                stale_cleaned: 1,
                orphans_cleaned: 0,
                errors: 0
            }
        );
        assert_eq!(f.storage.count_active_identifiers().await.unwrap(), 1);
        let idle = OwnerKey::new("idle").unwrap();
        assert_eq!(f.storage.count_identifiers(&idle, true).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn soft_mode_marks_rows() {
        let f = fixture_with(cleanup_config(true, false), None).await;
        seed(&f, "idle", 45, true).await;

        let report = f.job.run_once().await;
        assert_eq!(report.stale_cleaned, 1);
        let idle = OwnerKey::new("idle").unwrap();
        assert!(f.storage.find_active(&idle).await.unwrap().is_none());
        assert_eq!(f.storage.count_identifiers(&idle, true).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn orphans_are_removed_when_enabled() {
        let f = fixture_with(cleanup_config(false, true), None).await;
        seed(&f, "owned", 1, true).await;
        seed(&f, "orphan", 1, false).await;

        let report = f.job.run_once().await;
        assert_eq!(report.orphans_cleaned, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(f.storage.count_active_identifiers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn orphans_are_kept_when_disabled() {
        let f = fixture_with(cleanup_config(false, false), None).await;
        seed(&f, "orphan", 1, false).await;

        let report = f.job.run_once().await;
        assert_eq!(report, CleanupReport::default());
        assert_eq!(f.storage.count_active_identifiers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_orphan_scan_is_counted_and_stale_still_cleaned() {
        let f = fixture_with(cleanup_config(false, true), Some(Arc::new(BrokenDirectory))).await;
        seed(&f, "idle", 45, true).await;
        seed(&f, "busy", 1, true).await;

        let report = f.job.run_once().await;
        assert_eq!(report.stale_cleaned, 1);
        assert_eq!(report.orphans_cleaned, 0);
        assert_eq!(report.errors, 1);
    }

    #[tokio::test]
    async fn disabled_run_is_empty() {
        let mut config = cleanup_config(false, true);
        config.cleanup.enabled = false;
        let f = fixture_with(config, None).await;
        seed(&f, "idle", 45, false).await;

        assert_eq!(f.job.run_once().await, CleanupReport::default());
        assert_eq!(f.storage.count_active_identifiers().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn run_follows_reloaded_config() {
        let f = fixture_with(cleanup_config(false, false), None).await;
        seed(&f, "idle", 10, true).await;
        assert_eq!(f.job.run_once().await.stale_cleaned, 0);

        let mut tighter = cleanup_config(false, false);
        tighter.cleanup.inactivity_window_secs = 5 * DAY;
        f.handle.replace(tighter).unwrap();
        assert_eq!(f.job.run_once().await.stale_cleaned, 1);
    }

    #[tokio::test]
    async fn cleanup_task_disabled() {
        let mut config = Config::default();
        config.cleanup.enabled = false;
        let f = fixture_with(config, None).await;

        let handle = spawn_cleanup_task(f.job.clone(), Arc::new(ServerMetrics::default()));

        // Task should complete immediately when disabled
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("Task should complete when disabled")
            .expect("Task should not panic");
    }
}
