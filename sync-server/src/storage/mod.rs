//! Durable storage for sync records, profile identifiers and account existence.
//!
//! Each concern is its own trait so the coordinator and the identity
//! lifecycle only see the operations they own. [`SqliteStorage`] implements
//! all three.

mod sqlite;

pub use sqlite::SqliteStorage;

use crate::error::StorageError;
use async_trait::async_trait;
use sync_types::{ETag, OwnerKey, ProfileId};

/// The stored sync blob for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRecord {
    /// Owning account.
    pub owner_key: OwnerKey,
    /// Opaque payload.
    pub blob: Vec<u8>,
    /// Version token of this payload.
    pub etag: ETag,
    /// Unix timestamp of the last successful write.
    pub updated_at: i64,
}

/// Outcome of a conditional write at the storage layer.
///
/// Callers outside the coordinator only ever see "written" or "not written";
/// the two failure cases exist for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalWrite {
    /// The row matched and now carries this ETag.
    Written(ETag),
    /// No row exists for the owner.
    NoCandidate,
    /// A row exists but its ETag differs.
    Mismatch {
        /// The ETag currently stored, if it could be read back.
        current: Option<ETag>,
    },
}

/// Durable key → (bytes, ETag) table.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Current ETag for the owner, if a record exists.
    async fn peek_etag(&self, owner: &OwnerKey) -> Result<Option<ETag>, StorageError>;

    /// Full record for the owner, if one exists.
    async fn get_record(&self, owner: &OwnerKey) -> Result<Option<SyncRecord>, StorageError>;

    /// Insert or overwrite the owner's record with `etag`.
    async fn upsert_record(
        &self,
        owner: &OwnerKey,
        blob: &[u8],
        etag: &ETag,
        now: i64,
    ) -> Result<(), StorageError>;

    /// Overwrite the owner's record only if its ETag equals `expected`.
    ///
    /// Must be a single compare-and-set at the storage layer.
    async fn update_if_match(
        &self,
        owner: &OwnerKey,
        expected: &ETag,
        blob: &[u8],
        new_etag: &ETag,
        now: i64,
    ) -> Result<ConditionalWrite, StorageError>;
}

/// A durable profile identifier row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileIdentifier {
    /// Row primary key.
    pub id: i64,
    /// Owning account.
    pub owner_key: OwnerKey,
    /// The identifier itself.
    pub identifier: ProfileId,
    /// Unix timestamp of promotion.
    pub created_at: i64,
    /// Unix timestamp of the last recorded use.
    pub last_activity_at: i64,
    /// Unix timestamp of soft deletion, if any.
    pub deleted_at: Option<i64>,
}

impl ProfileIdentifier {
    /// Whether the row has not been soft-deleted.
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Durable table of promoted profile identifiers.
///
/// At most one active row per owner; identifiers are unique across all rows.
#[async_trait]
pub trait IdentifierStore: Send + Sync {
    /// The owner's active row, if any.
    async fn find_active(
        &self,
        owner: &OwnerKey,
    ) -> Result<Option<ProfileIdentifier>, StorageError>;

    /// Insert a new active row.
    ///
    /// Fails with [`StorageError::Conflict`] if the owner already has an
    /// active row or the identifier is taken.
    async fn insert_identifier(
        &self,
        owner: &OwnerKey,
        identifier: &ProfileId,
        now: i64,
    ) -> Result<ProfileIdentifier, StorageError>;

    /// Refresh `last_activity_at` on an active row. Returns `false` if it is gone.
    async fn touch(&self, id: i64, now: i64) -> Result<bool, StorageError>;

    /// Point an active row at a different identifier and refresh its activity.
    async fn replace_identifier(
        &self,
        id: i64,
        identifier: &ProfileId,
        now: i64,
    ) -> Result<bool, StorageError>;

    /// Reactivate the owner's soft-deleted row holding `identifier`.
    ///
    /// Returns the revived row, or `None` if no such deleted row exists.
    async fn restore_identifier(
        &self,
        owner: &OwnerKey,
        identifier: &ProfileId,
        now: i64,
    ) -> Result<Option<ProfileIdentifier>, StorageError>;

    /// Active rows idle since before `older_than`, oldest first, at most `limit`.
    async fn find_stale(
        &self,
        older_than: i64,
        limit: u32,
    ) -> Result<Vec<ProfileIdentifier>, StorageError>;

    /// Active rows with `id > after_id`, ascending by id, at most `limit`.
    async fn list_active_after(
        &self,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<ProfileIdentifier>, StorageError>;

    /// Hard-delete rows by primary key. Returns rows removed.
    async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64, StorageError>;

    /// Soft-delete active rows by primary key. Returns rows marked.
    async fn soft_delete_by_ids(&self, ids: &[i64], now: i64) -> Result<u64, StorageError>;
}

/// Account existence, owned by the user-management side of the system.
#[async_trait]
pub trait AccountDirectory: Send + Sync {
    /// Whether an account with this owner key exists.
    async fn account_exists(&self, owner: &OwnerKey) -> Result<bool, StorageError>;
}
