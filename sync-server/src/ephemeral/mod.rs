//! Ephemeral tier: a shared TTL key-value cache.
//!
//! The cache is external to the service and shared by every instance, so
//! anything that needs cross-instance agreement goes through the atomic
//! commands here (`set_if_absent`, sorted-set updates) rather than through
//! in-process locks.

mod memory;

pub use memory::{spawn_sweeper, MemoryEphemeralStore};

use crate::error::EphemeralResult;
use async_trait::async_trait;
use std::time::Duration;

/// Commands the service needs from the TTL cache.
///
/// Semantics follow the usual Redis-style commands of the same purpose.
/// Every method may fail with [`crate::error::EphemeralError::Unavailable`].
#[async_trait]
pub trait EphemeralStore: Send + Sync + std::fmt::Debug {
    /// Read a string value. Expired keys read as absent.
    async fn get(&self, key: &str) -> EphemeralResult<Option<String>>;

    /// Write a string value, replacing whatever was there, with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> EphemeralResult<()>;

    /// Write a string value only if the key is absent.
    ///
    /// Returns `true` if this call created the key. Atomic with respect to
    /// every other caller of the same cache.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
        -> EphemeralResult<bool>;

    /// Reset the TTL of an existing key. Returns `false` if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> EphemeralResult<bool>;

    /// Delete a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> EphemeralResult<bool>;

    /// Add `member` with `score` to the sorted set at `key`, creating it if needed.
    async fn sorted_add(&self, key: &str, score: i64, member: &str) -> EphemeralResult<()>;

    /// Remove every member whose score is strictly below `min_score`.
    ///
    /// Returns the number of members removed.
    async fn sorted_remove_below(&self, key: &str, min_score: i64) -> EphemeralResult<u64>;

    /// Number of members in the sorted set at `key` (0 if absent).
    async fn sorted_len(&self, key: &str) -> EphemeralResult<u64>;
}

#[cfg(test)]
pub(crate) mod testing;
