//! SQLite storage backend for profile-sync-server.

use super::{
    AccountDirectory, BlobStore, ConditionalWrite, IdentifierStore, ProfileIdentifier,
    SyncRecord,
};
use crate::error::StorageError;
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite};
use std::path::Path;
use std::str::FromStr;
use sync_types::{ETag, OwnerKey, ProfileId};

/// Upper bound on bound parameters per batched statement.
const MAX_BATCH_BINDS: usize = 500;

/// SQLite-based durable storage.
///
/// Uses WAL mode for concurrent reads/writes.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStorage")
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl SqliteStorage {
    /// Open (or create) a database file.
    pub async fn new(path: &Path) -> Result<Self, StorageError> {
        if path.as_os_str().is_empty() {
            return Err(StorageError::InvalidPath {
                path: path.to_path_buf(),
            });
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create an in-memory SQLite storage (for testing).
    pub async fn in_memory() -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(":memory:")
            .map_err(StorageError::Database)?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal);

        // A single connection: every `:memory:` connection is its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StorageError::Database)?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create tables and indexes if they do not exist.
    async fn run_migrations(&self) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS sync_records (
                owner_key TEXT PRIMARY KEY,
                blob BLOB NOT NULL,
                etag TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS profile_identifiers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_key TEXT NOT NULL,
                identifier TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL,
                last_activity_at INTEGER NOT NULL,
                deleted_at INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                owner_key TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )
            "#,
            // One active identifier per owner.
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_profile_identifiers_active_owner
            ON profile_identifiers(owner_key) WHERE deleted_at IS NULL
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_profile_identifiers_activity
            ON profile_identifiers(last_activity_at) WHERE deleted_at IS NULL
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| StorageError::Migration(e.to_string()))?;
        }

        Ok(())
    }

    /// Register an account so orphan scans treat its identifiers as owned.
    pub async fn create_account(&self, owner: &OwnerKey, now: i64) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO accounts (owner_key, created_at) VALUES (?1, ?2)
            ON CONFLICT(owner_key) DO NOTHING
            "#,
        )
        .bind(owner.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(())
    }

    /// Remove an account. Returns `true` if it existed.
    pub async fn remove_account(&self, owner: &OwnerKey) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM accounts WHERE owner_key = ?1")
            .bind(owner.as_str())
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    /// Count identifier rows for an owner, including soft-deleted ones.
    pub async fn count_identifiers(
        &self,
        owner: &OwnerKey,
        include_deleted: bool,
    ) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM profile_identifiers
            WHERE owner_key = ?1 AND (?2 OR deleted_at IS NULL)
            "#,
        )
        .bind(owner.as_str())
        .bind(include_deleted)
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    /// Total sync records stored.
    pub async fn count_records(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sync_records")
            .fetch_one(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    /// Total active profile identifiers.
    pub async fn count_active_identifiers(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM profile_identifiers WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(count as u64)
    }

    /// Overwrite `last_activity_at` on a row (for backfills and tests).
    pub async fn set_last_activity(&self, id: i64, at: i64) -> Result<(), StorageError> {
        sqlx::query("UPDATE profile_identifiers SET last_activity_at = ?2 WHERE id = ?1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(StorageError::Database)?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for SqliteStorage {
    async fn peek_etag(&self, owner: &OwnerKey) -> Result<Option<ETag>, StorageError> {
        let etag: Option<String> =
            sqlx::query_scalar("SELECT etag FROM sync_records WHERE owner_key = ?1")
                .bind(owner.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        Ok(etag.map(ETag::new))
    }

    async fn get_record(&self, owner: &OwnerKey) -> Result<Option<SyncRecord>, StorageError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT owner_key, blob, etag, updated_at
            FROM sync_records
            WHERE owner_key = ?1
            "#,
        )
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(SyncRecord::try_from).transpose()
    }

    async fn upsert_record(
        &self,
        owner: &OwnerKey,
        blob: &[u8],
        etag: &ETag,
        now: i64,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO sync_records (owner_key, blob, etag, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(owner_key) DO UPDATE SET
                blob = excluded.blob,
                etag = excluded.etag,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(owner.as_str())
        .bind(blob)
        .bind(etag.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        Ok(())
    }

    async fn update_if_match(
        &self,
        owner: &OwnerKey,
        expected: &ETag,
        blob: &[u8],
        new_etag: &ETag,
        now: i64,
    ) -> Result<ConditionalWrite, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE sync_records
            SET blob = ?3, etag = ?4, updated_at = ?5
            WHERE owner_key = ?1 AND etag = ?2
            "#,
        )
        .bind(owner.as_str())
        .bind(expected.as_str())
        .bind(blob)
        .bind(new_etag.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        if result.rows_affected() == 1 {
            return Ok(ConditionalWrite::Written(new_etag.clone()));
        }

        // Not written. Read back only to tell the two cases apart in logs.
        match self.peek_etag(owner).await {
            Ok(None) => Ok(ConditionalWrite::NoCandidate),
            Ok(Some(current)) => Ok(ConditionalWrite::Mismatch {
                current: Some(current),
            }),
            Err(e) => {
                tracing::debug!("Could not read back etag for {}: {}", owner, e);
                Ok(ConditionalWrite::Mismatch { current: None })
            }
        }
    }
}

#[async_trait]
impl IdentifierStore for SqliteStorage {
    async fn find_active(
        &self,
        owner: &OwnerKey,
    ) -> Result<Option<ProfileIdentifier>, StorageError> {
        let row = sqlx::query_as::<_, IdentifierRow>(
            r#"
            SELECT id, owner_key, identifier, created_at, last_activity_at, deleted_at
            FROM profile_identifiers
            WHERE owner_key = ?1 AND deleted_at IS NULL
            "#,
        )
        .bind(owner.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        row.map(ProfileIdentifier::try_from).transpose()
    }

    async fn insert_identifier(
        &self,
        owner: &OwnerKey,
        identifier: &ProfileId,
        now: i64,
    ) -> Result<ProfileIdentifier, StorageError> {
        let row = sqlx::query_as::<_, IdentifierRow>(
            r#"
            INSERT INTO profile_identifiers (owner_key, identifier, created_at, last_activity_at)
            VALUES (?1, ?2, ?3, ?3)
            RETURNING id, owner_key, identifier, created_at, last_activity_at, deleted_at
            "#,
        )
        .bind(owner.as_str())
        .bind(identifier.as_str())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StorageError::from_write(e, format!("profile identifier for {owner}")))?;

        row.try_into()
    }

    async fn touch(&self, id: i64, now: i64) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE profile_identifiers SET last_activity_at = ?2
            WHERE id = ?1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(StorageError::Database)?;
        Ok(result.rows_affected() == 1)
    }

    async fn replace_identifier(
        &self,
        id: i64,
        identifier: &ProfileId,
        now: i64,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE profile_identifiers SET identifier = ?2, last_activity_at = ?3
            WHERE id = ?1 AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(identifier.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::from_write(e, format!("identifier {identifier}")))?;
        Ok(result.rows_affected() == 1)
    }

    async fn restore_identifier(
        &self,
        owner: &OwnerKey,
        identifier: &ProfileId,
        now: i64,
    ) -> Result<Option<ProfileIdentifier>, StorageError> {
        let row = sqlx::query_as::<_, IdentifierRow>(
            r#"
            UPDATE profile_identifiers SET deleted_at = NULL, last_activity_at = ?3
            WHERE owner_key = ?1 AND identifier = ?2 AND deleted_at IS NOT NULL
            RETURNING id, owner_key, identifier, created_at, last_activity_at, deleted_at
            "#,
        )
        .bind(owner.as_str())
        .bind(identifier.as_str())
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::from_write(e, format!("profile identifier for {owner}")))?;

        row.map(ProfileIdentifier::try_from).transpose()
    }

    async fn find_stale(
        &self,
        older_than: i64,
        limit: u32,
    ) -> Result<Vec<ProfileIdentifier>, StorageError> {
        let rows = sqlx::query_as::<_, IdentifierRow>(
            r#"
            SELECT id, owner_key, identifier, created_at, last_activity_at, deleted_at
            FROM profile_identifiers
            WHERE deleted_at IS NULL AND last_activity_at < ?1
            ORDER BY last_activity_at ASC, id ASC
            LIMIT ?2
            "#,
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(ProfileIdentifier::try_from).collect()
    }

    async fn list_active_after(
        &self,
        after_id: i64,
        limit: u32,
    ) -> Result<Vec<ProfileIdentifier>, StorageError> {
        let rows = sqlx::query_as::<_, IdentifierRow>(
            r#"
            SELECT id, owner_key, identifier, created_at, last_activity_at, deleted_at
            FROM profile_identifiers
            WHERE deleted_at IS NULL AND id > ?1
            ORDER BY id ASC
            LIMIT ?2
            "#,
        )
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(StorageError::Database)?;

        rows.into_iter().map(ProfileIdentifier::try_from).collect()
    }

    async fn delete_by_ids(&self, ids: &[i64]) -> Result<u64, StorageError> {
        let mut deleted = 0;
        for chunk in ids.chunks(MAX_BATCH_BINDS) {
            let mut query =
                QueryBuilder::<Sqlite>::new("DELETE FROM profile_identifiers WHERE id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let result = query
                .build()
                .execute(&self.pool)
                .await
                .map_err(StorageError::Database)?;
            deleted += result.rows_affected();
        }
        Ok(deleted)
    }

    async fn soft_delete_by_ids(&self, ids: &[i64], now: i64) -> Result<u64, StorageError> {
        let mut marked = 0;
        for chunk in ids.chunks(MAX_BATCH_BINDS) {
            let mut query = QueryBuilder::<Sqlite>::new(
                "UPDATE profile_identifiers SET deleted_at = ",
            );
            query.push_bind(now);
            query.push(" WHERE deleted_at IS NULL AND id IN (");
            let mut separated = query.separated(", ");
            for id in chunk {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");

            let result = query
                .build()
                .execute(&self.pool)
                .await
                .map_err(StorageError::Database)?;
            marked += result.rows_affected();
        }
        Ok(marked)
    }
}

#[async_trait]
impl AccountDirectory for SqliteStorage {
    async fn account_exists(&self, owner: &OwnerKey) -> Result<bool, StorageError> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM accounts WHERE owner_key = ?1")
                .bind(owner.as_str())
                .fetch_optional(&self.pool)
                .await
                .map_err(StorageError::Database)?;
        Ok(found.is_some())
    }
}

/// Internal row type for `sync_records`.
#[derive(sqlx::FromRow)]
struct RecordRow {
    owner_key: String,
    blob: Vec<u8>,
    etag: String,
    updated_at: i64,
}

impl TryFrom<RecordRow> for SyncRecord {
    type Error = StorageError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        Ok(SyncRecord {
            owner_key: OwnerKey::new(row.owner_key).map_err(|e| StorageError::CorruptRow {
                table: "sync_records",
                reason: e.to_string(),
            })?,
            blob: row.blob,
            etag: ETag::new(row.etag),
            updated_at: row.updated_at,
        })
    }
}

/// Internal row type for `profile_identifiers`.
#[derive(sqlx::FromRow)]
struct IdentifierRow {
    id: i64,
    owner_key: String,
    identifier: String,
    created_at: i64,
    last_activity_at: i64,
    deleted_at: Option<i64>,
}

impl TryFrom<IdentifierRow> for ProfileIdentifier {
    type Error = StorageError;

    fn try_from(row: IdentifierRow) -> Result<Self, Self::Error> {
        let corrupt = |e: sync_types::IdError| StorageError::CorruptRow {
            table: "profile_identifiers",
            reason: format!("row {}: {}", row.id, e),
        };
        Ok(ProfileIdentifier {
            id: row.id,
            owner_key: OwnerKey::new(row.owner_key.clone()).map_err(corrupt)?,
            identifier: ProfileId::new(row.identifier.clone()).map_err(corrupt)?,
            created_at: row.created_at,
            last_activity_at: row.last_activity_at,
            deleted_at: row.deleted_at,
        })
    }
}
