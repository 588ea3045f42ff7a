//! ETag-gated read/write of the per-account sync blob.
//!
//! Every successful write mints a fresh [`ETag`], so two writes of identical
//! bytes still produce distinct versions. A conditional write that loses the
//! race (or has nothing to compare against) is a normal `None`, not an error.

use crate::clock::Clock;
use crate::config::ConfigHandle;
use crate::error::{Result, ServerError};
use crate::storage::{BlobStore, ConditionalWrite};
use std::sync::Arc;
use sync_types::{ETag, OwnerKey};

/// The sync protocol over a [`BlobStore`].
#[derive(Clone)]
pub struct SyncCoordinator {
    store: Arc<dyn BlobStore>,
    clock: Arc<dyn Clock>,
    config: ConfigHandle,
}

impl std::fmt::Debug for SyncCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncCoordinator")
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl SyncCoordinator {
    /// Create a coordinator over `store`.
    pub fn new(store: Arc<dyn BlobStore>, clock: Arc<dyn Clock>, config: ConfigHandle) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Current ETag for the owner, or `None` if nothing has been written.
    pub async fn peek_etag(&self, owner: &OwnerKey) -> Result<Option<ETag>> {
        Ok(self.store.peek_etag(owner).await?)
    }

    /// The owner's blob and its ETag, or `None` if nothing has been written.
    pub async fn read(&self, owner: &OwnerKey) -> Result<Option<(Vec<u8>, ETag)>> {
        let record = self.store.get_record(owner).await?;
        Ok(record.map(|r| (r.blob, r.etag)))
    }

    /// Unconditionally store `blob`, returning its new ETag.
    pub async fn write(&self, owner: &OwnerKey, blob: &[u8]) -> Result<ETag> {
        self.check_size(blob)?;
        let etag = ETag::generate();
        self.store
            .upsert_record(owner, blob, &etag, self.clock.now_secs())
            .await?;
        tracing::debug!("Wrote {} bytes for {} as {}", blob.len(), owner, etag);
        Ok(etag)
    }

    /// Store `blob` only if the current version is `expected`.
    ///
    /// Returns the new ETag, or `None` without mutating anything if the
    /// record is missing or has moved on.
    pub async fn write_if_match(
        &self,
        owner: &OwnerKey,
        expected: &ETag,
        blob: &[u8],
    ) -> Result<Option<ETag>> {
        self.check_size(blob)?;
        let candidate = ETag::generate();
        let outcome = self
            .store
            .update_if_match(owner, expected, blob, &candidate, self.clock.now_secs())
            .await?;

        match outcome {
            ConditionalWrite::Written(etag) => {
                tracing::debug!("Conditional write for {}: {} -> {}", owner, expected, etag);
                Ok(Some(etag))
            }
            ConditionalWrite::NoCandidate => {
                tracing::debug!("Conditional write for {}: no record to match", owner);
                Ok(None)
            }
            ConditionalWrite::Mismatch { current } => {
                tracing::debug!(
                    "Conditional write for {}: expected {}, current {:?}",
                    owner,
                    expected,
                    current
                );
                Ok(None)
            }
        }
    }

    pub(crate) fn check_size(&self, blob: &[u8]) -> Result<()> {
        let limit = self.config.load().storage.max_blob_size;
        if blob.len() > limit {
            return Err(ServerError::BlobTooLarge {
                size: blob.len(),
                limit,
            });
        }
        Ok(())
    }
}
