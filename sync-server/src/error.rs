//! Error types for profile-sync-server.

use std::path::PathBuf;

/// Main error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Durable storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Ephemeral cache error.
    #[error("ephemeral store error: {0}")]
    Ephemeral(#[from] EphemeralError),

    /// Request input was invalid.
    #[error("validation failed: {0}")]
    Validation(#[from] sync_types::IdError),

    /// The request carried no authenticated principal.
    #[error("missing authenticated principal")]
    Unauthenticated,

    /// Blob exceeds the configured size limit.
    #[error("blob too large: {size} bytes (limit: {limit} bytes)")]
    BlobTooLarge {
        /// Actual size of the blob.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// A contended operation gave up after its retry budget.
    ///
    /// Retryable by the caller.
    #[error("{operation} still contended after {attempts} attempts")]
    RetryExhausted {
        /// The operation that gave up.
        operation: &'static str,
        /// Number of attempts made.
        attempts: u32,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Whether the caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. } | Self::Ephemeral(_))
    }
}

/// Durable storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A uniqueness constraint rejected the write.
    #[error("unique constraint violated: {what}")]
    Conflict {
        /// What collided.
        what: String,
    },

    /// A stored row could not be decoded.
    #[error("corrupt row in {table}: {reason}")]
    CorruptRow {
        /// Table the row came from.
        table: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// Migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Database path error.
    #[error("invalid database path: {path}")]
    InvalidPath {
        /// The invalid path.
        path: PathBuf,
    },
}

impl StorageError {
    /// Map a sqlx error, turning unique violations into [`StorageError::Conflict`].
    pub(crate) fn from_write(err: sqlx::Error, what: impl Into<String>) -> Self {
        let unique = err
            .as_database_error()
            .map(|db| db.is_unique_violation())
            .unwrap_or(false);
        if unique {
            Self::Conflict { what: what.into() }
        } else {
            Self::Database(err)
        }
    }
}

/// Ephemeral cache errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EphemeralError {
    /// The cache backend could not be reached or failed the command.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The key holds a value of a different kind than the command expects.
    #[error("wrong value type at key {key}")]
    WrongType {
        /// The offending key.
        key: String,
    },
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Result type alias for storage operations.
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Result type alias for ephemeral cache operations.
pub type EphemeralResult<T> = std::result::Result<T, EphemeralError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_exhausted_is_retryable() {
        let err = ServerError::RetryExhausted {
            operation: "profile create",
            attempts: 3,
        };
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "profile create still contended after 3 attempts");
    }

    #[test]
    fn validation_is_not_retryable() {
        let err = ServerError::from(sync_types::IdError::EmptyOwnerKey);
        assert!(!err.is_retryable());
    }

    #[test]
    fn non_database_error_is_not_conflict() {
        let err = StorageError::from_write(sqlx::Error::RowNotFound, "x");
        assert!(matches!(err, StorageError::Database(_)));
    }
}
