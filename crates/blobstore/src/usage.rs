//! Usage checks consulted before anything is removed.

use async_trait::async_trait;

use crate::blob::BlobRef;

/// Answers whether a store or blob is still referenced or open elsewhere.
///
/// Stores consult [`UsageChecker::is_blob_in_use`] before physically freeing a
/// deleted blob; the manager consults [`UsageChecker::is_store_in_use`] before
/// deleting a store.
#[async_trait]
pub trait UsageChecker: Send + Sync {
    /// Is the store referenced by any repository?
    async fn is_store_in_use(&self, store: &str) -> anyhow::Result<bool>;

    /// Is the blob currently being read or written?
    async fn is_blob_in_use(&self, blob: &BlobRef) -> anyhow::Result<bool>;
}

/// Reports nothing as in use.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoUsage;

#[async_trait]
impl UsageChecker for NoUsage {
    async fn is_store_in_use(&self, _store: &str) -> anyhow::Result<bool> {
        Ok(false)
    }

    async fn is_blob_in_use(&self, _blob: &BlobRef) -> anyhow::Result<bool> {
        Ok(false)
    }
}
