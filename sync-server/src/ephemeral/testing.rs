//! Misbehaving [`EphemeralStore`] doubles for tests.

use super::EphemeralStore;
use crate::error::{EphemeralError, EphemeralResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Every command fails as if the cache were unreachable.
#[derive(Debug, Default)]
pub(crate) struct UnavailableStore;

fn down<T>() -> EphemeralResult<T> {
    Err(EphemeralError::Unavailable("connection refused".into()))
}

#[async_trait]
impl EphemeralStore for UnavailableStore {
    async fn get(&self, _key: &str) -> EphemeralResult<Option<String>> {
        down()
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> EphemeralResult<()> {
        down()
    }
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> EphemeralResult<bool> {
        down()
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> EphemeralResult<bool> {
        down()
    }
    async fn delete(&self, _key: &str) -> EphemeralResult<bool> {
        down()
    }
    async fn sorted_add(&self, _key: &str, _score: i64, _member: &str) -> EphemeralResult<()> {
        down()
    }
    async fn sorted_remove_below(&self, _key: &str, _min_score: i64) -> EphemeralResult<u64> {
        down()
    }
    async fn sorted_len(&self, _key: &str) -> EphemeralResult<u64> {
        down()
    }
}

/// Simulates another instance always winning the create race: reads see
/// nothing, and every `set_if_absent` reports the key as taken.
#[derive(Debug, Default)]
pub(crate) struct ContendedStore {
    pub(crate) create_attempts: AtomicU32,
}

#[async_trait]
impl EphemeralStore for ContendedStore {
    async fn get(&self, _key: &str) -> EphemeralResult<Option<String>> {
        Ok(None)
    }
    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> EphemeralResult<()> {
        Ok(())
    }
    async fn set_if_absent(&self, _key: &str, _value: &str, _ttl: Duration) -> EphemeralResult<bool> {
        self.create_attempts.fetch_add(1, Ordering::SeqCst);
        Ok(false)
    }
    async fn expire(&self, _key: &str, _ttl: Duration) -> EphemeralResult<bool> {
        Ok(false)
    }
    async fn delete(&self, _key: &str) -> EphemeralResult<bool> {
        Ok(false)
    }
    async fn sorted_add(&self, _key: &str, _score: i64, _member: &str) -> EphemeralResult<()> {
        Ok(())
    }
    async fn sorted_remove_below(&self, _key: &str, _min_score: i64) -> EphemeralResult<u64> {
        Ok(0)
    }
    async fn sorted_len(&self, _key: &str) -> EphemeralResult<u64> {
        Ok(0)
    }
}
