//! Two-tier profile identifier lifecycle.
//!
//! A profile identifier starts life in the ephemeral tier with a short TTL
//! and may vanish without trace. The first real use promotes it into the
//! durable tier, after which the durable row is authoritative and the cache
//! entry is only a projection of it.
//!
//! ```text
//! Absent ──get_or_create──► EphemeralOnly ──promote──► Promoted
//!   ▲                                                     │
//!   └──────────────────── cleanup (stale / orphan) ◄──────┘
//! ```
//!
//! Cleanup evicts the cache entry of every row it removes. A soft-deleted
//! identifier that is promoted again revives its old row, since identifiers
//! stay unique across deleted rows.
//!
//! Cross-instance races are settled by the cache's `set_if_absent` and the
//! durable store's unique indexes; nothing here takes an in-process lock.

use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::ephemeral::EphemeralStore;
use crate::error::{Result, ServerError, StorageError};
use crate::storage::{AccountDirectory, IdentifierStore, ProfileIdentifier};
use std::sync::Arc;
use std::time::Duration;
use sync_types::{OwnerKey, ProfileId};

/// Attempts `get_or_create` makes before reporting contention.
pub const MAX_CREATE_ATTEMPTS: u32 = 3;

/// What `promote` did to the durable tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromoteOutcome {
    /// First promotion for this owner; a row was inserted.
    Inserted,
    /// The owner's row already held this identifier; activity was refreshed.
    Refreshed,
    /// The owner's row held a different identifier and now holds this one.
    Replaced {
        /// The identifier that was overwritten.
        previous: ProfileId,
    },
    /// A soft-deleted row for this owner and identifier was reactivated.
    Restored,
}

/// How cleanup removes durable rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionMode {
    /// Delete the rows.
    Hard,
    /// Stamp `deleted_at` and keep the rows.
    Soft,
}

/// Get-or-create, promotion and cleanup scans for profile identifiers.
#[derive(Clone)]
pub struct IdentityLifecycle {
    ephemeral: Arc<dyn EphemeralStore>,
    store: Arc<dyn IdentifierStore>,
    accounts: Arc<dyn AccountDirectory>,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
}

impl std::fmt::Debug for IdentityLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityLifecycle")
            .field("ephemeral", &self.ephemeral)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

fn cache_key(owner: &OwnerKey) -> String {
    format!("profile:{owner}")
}

impl IdentityLifecycle {
    /// Create a lifecycle over the two tiers and the account directory.
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        store: Arc<dyn IdentifierStore>,
        accounts: Arc<dyn AccountDirectory>,
        clock: Arc<dyn Clock>,
        config: ConfigHandle,
    ) -> Self {
        Self {
            ephemeral,
            store,
            accounts,
            clock,
            config,
        }
    }

    fn ttls(&self) -> (Duration, Duration) {
        let config = self.config.load();
        (
            Duration::from_secs(config.identity.ephemeral_ttl_secs),
            Duration::from_secs(config.identity.promoted_ttl_secs),
        )
    }

    /// Return the owner's current profile identifier, creating one if needed.
    ///
    /// Lookup order is cache, then durable tier, then a fresh identifier
    /// claimed with `set_if_absent`. Losing the claim to a concurrent caller
    /// restarts the lookup, at most [`MAX_CREATE_ATTEMPTS`] times.
    pub async fn get_or_create(&self, owner: &OwnerKey) -> Result<ProfileId> {
        let (base_ttl, promoted_ttl) = self.ttls();
        let key = cache_key(owner);

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            if let Some(cached) = self.ephemeral.get(&key).await? {
                match ProfileId::new(cached) {
                    Ok(identifier) => {
                        self.ephemeral.expire(&key, base_ttl).await?;
                        return Ok(identifier);
                    }
                    Err(e) => {
                        tracing::warn!("Dropping malformed cached identifier for {}: {}", owner, e);
                        self.ephemeral.delete(&key).await?;
                    }
                }
            }

            if let Some(row) = self.store.find_active(owner).await? {
                self.ephemeral
                    .set(&key, row.identifier.as_str(), promoted_ttl)
                    .await?;
                self.store.touch(row.id, self.clock.now_secs()).await?;
                tracing::debug!("Restored durable identifier {:?} for {}", row.identifier, owner);
                return Ok(row.identifier);
            }

            let fresh = ProfileId::random();
            if self
                .ephemeral
                .set_if_absent(&key, fresh.as_str(), base_ttl)
                .await?
            {
                tracing::debug!("Created ephemeral identifier {:?} for {}", fresh, owner);
                return Ok(fresh);
            }

            tracing::debug!(
                "Lost identifier create race for {} (attempt {}/{})",
                owner,
                attempt,
                MAX_CREATE_ATTEMPTS
            );
        }

        tracing::warn!("Identifier creation for {} still contended, giving up", owner);
        Err(ServerError::RetryExhausted {
            operation: "profile identifier create",
            attempts: MAX_CREATE_ATTEMPTS,
        })
    }

    /// Record real use of `identifier` by `owner`, copying it into the durable tier.
    ///
    /// Idempotent for a repeated identifier. A different identifier replaces
    /// the stored one: the most recently active session owns the slot.
    /// Extending the cache entry afterwards is best-effort.
    pub async fn promote(&self, owner: &OwnerKey, identifier: &ProfileId) -> Result<PromoteOutcome> {
        let now = self.clock.now_secs();

        let outcome = match self.store.find_active(owner).await? {
            Some(row) => self.update_existing(row, identifier, now).await?,
            None => match self.store.insert_identifier(owner, identifier, now).await {
                Ok(row) => {
                    tracing::info!("Promoted identifier {:?} for {} (row {})", identifier, owner, row.id);
                    PromoteOutcome::Inserted
                }
                Err(err @ StorageError::Conflict { .. }) => {
                    // Another promoter inserted first, or the identifier sits
                    // on one of this owner's soft-deleted rows.
                    match self.store.find_active(owner).await? {
                        Some(row) => self.update_existing(row, identifier, now).await?,
                        None => match self.store.restore_identifier(owner, identifier, now).await? {
                            Some(row) => {
                                tracing::info!(
                                    "Restored soft-deleted identifier {:?} for {} (row {})",
                                    identifier,
                                    owner,
                                    row.id
                                );
                                PromoteOutcome::Restored
                            }
                            None => return Err(err.into()),
                        },
                    }
                }
                Err(err) => return Err(err.into()),
            },
        };

        let (_, promoted_ttl) = self.ttls();
        if let Err(e) = self
            .ephemeral
            .set(&cache_key(owner), identifier.as_str(), promoted_ttl)
            .await
        {
            tracing::warn!(
                "Promoted {:?} for {} but could not extend cache entry: {}",
                identifier,
                owner,
                e
            );
        }

        Ok(outcome)
    }

    async fn update_existing(
        &self,
        row: ProfileIdentifier,
        identifier: &ProfileId,
        now: i64,
    ) -> Result<PromoteOutcome> {
        if row.identifier == *identifier {
            if !self.store.touch(row.id, now).await? {
                tracing::debug!("Row {} vanished while refreshing {:?}", row.id, identifier);
            }
            return Ok(PromoteOutcome::Refreshed);
        }

        tracing::warn!(
            "Owner {} switched identifier {:?} -> {:?}; keeping the newer one",
            row.owner_key,
            row.identifier,
            identifier
        );
        self.store
            .replace_identifier(row.id, identifier, now)
            .await?;
        Ok(PromoteOutcome::Replaced {
            previous: row.identifier,
        })
    }

    /// Active rows idle since before `older_than` (Unix seconds), at most `limit`.
    pub async fn find_stale(&self, older_than: i64, limit: u32) -> Result<Vec<ProfileIdentifier>> {
        Ok(self.store.find_stale(older_than, limit).await?)
    }

    /// Active rows whose owner has no account, at most `limit`.
    ///
    /// Rows whose account lookup fails are kept. If every lookup failed the
    /// last lookup error is returned so callers can count it.
    pub async fn find_orphaned(&self, limit: u32) -> Result<Vec<ProfileIdentifier>> {
        let mut orphans = Vec::new();
        let mut last_failure = None;
        let mut after_id = 0;

        while (orphans.len() as u32) < limit {
            let page = self.store.list_active_after(after_id, limit).await?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            for row in page {
                match self.accounts.account_exists(&row.owner_key).await {
                    Ok(true) => {}
                    Ok(false) => {
                        orphans.push(row);
                        if orphans.len() as u32 >= limit {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Account lookup for {} failed: {}", row.owner_key, e);
                        last_failure = Some(e);
                    }
                }
            }
        }

        if orphans.is_empty() {
            if let Some(err) = last_failure {
                return Err(err.into());
            }
        }
        Ok(orphans)
    }

    /// Hard-delete rows. See [`IdentityLifecycle::remove_batch`].
    pub async fn delete_batch(&self, rows: &[ProfileIdentifier]) -> Result<u64> {
        self.remove_batch(rows, DeletionMode::Hard).await
    }

    /// Soft-delete rows. See [`IdentityLifecycle::remove_batch`].
    pub async fn soft_delete_batch(&self, rows: &[ProfileIdentifier]) -> Result<u64> {
        self.remove_batch(rows, DeletionMode::Soft).await
    }

    /// Remove rows by primary key in one batch.
    ///
    /// Empty input is a no-op. Rows with a malformed (non-positive) key are
    /// skipped so they cannot block the rest of the batch. Cached entries
    /// still pointing at a removed identifier are evicted, best-effort.
    pub async fn remove_batch(&self, rows: &[ProfileIdentifier], mode: DeletionMode) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }

        let (ids, malformed): (Vec<i64>, Vec<i64>) =
            rows.iter().map(|row| row.id).partition(|id| *id > 0);
        if !malformed.is_empty() {
            tracing::warn!("Skipping {} rows with malformed ids: {:?}", malformed.len(), malformed);
        }
        if ids.is_empty() {
            return Ok(0);
        }

        let removed = match mode {
            DeletionMode::Hard => self.store.delete_by_ids(&ids).await?,
            DeletionMode::Soft => {
                self.store
                    .soft_delete_by_ids(&ids, self.clock.now_secs())
                    .await?
            }
        };
        tracing::debug!("Removed {} of {} identifier rows ({:?})", removed, ids.len(), mode);

        for row in rows.iter().filter(|row| row.id > 0) {
            self.evict_cached(row).await;
        }
        Ok(removed)
    }

    /// Drop the owner's cache entry if it still holds the row's identifier.
    async fn evict_cached(&self, row: &ProfileIdentifier) {
        let key = cache_key(&row.owner_key);
        let evicted = match self.ephemeral.get(&key).await {
            Ok(Some(cached)) if cached == row.identifier.as_str() => {
                self.ephemeral.delete(&key).await.map(|_| ())
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = evicted {
            tracing::warn!("Could not evict cached identifier for {}: {}", row.owner_key, e);
        }
    }
}
