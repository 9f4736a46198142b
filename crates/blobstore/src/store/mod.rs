//! The uniform backend contract every blob store implements.

mod base;
pub(crate) mod layout;
mod properties;

pub use base::StoreCore;
pub use properties::{BlobProperties, DeletionMark};

use std::fmt::{self, Debug};
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::blob::{Blob, BlobHeaders, BlobRef, ExternalMetadata};
use crate::configuration::BlobStoreConfiguration;
use crate::error::Result;
use crate::file::FileBlobStore;
use crate::group::BlobStoreGroup;
use crate::usage::UsageChecker;

/// Lifecycle state of a store instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    New,
    Started,
    Stopped,
    Failed,
}

impl StoreState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreState::New => "new",
            StoreState::Started => "started",
            StoreState::Stopped => "stopped",
            StoreState::Failed => "failed",
        }
    }
}

impl fmt::Display for StoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "started" => StoreState::Started,
            "stopped" => StoreState::Stopped,
            "failed" => StoreState::Failed,
            _ => StoreState::New,
        })
    }
}

/// Space accounting for a store. Soft-deleted blobs count until compaction
/// reclaims them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMetrics {
    pub blob_count: u64,
    pub total_size: u64,
}

impl std::ops::Add for StoreMetrics {
    type Output = StoreMetrics;

    fn add(self, rhs: Self) -> Self::Output {
        StoreMetrics {
            blob_count: self.blob_count + rhs.blob_count,
            total_size: self.total_size + rhs.total_size,
        }
    }
}

/// Result of one compaction pass over a store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Deleted blobs considered for reclamation
    pub examined: usize,
    /// Blobs physically removed
    pub reclaimed: usize,
    pub reclaimed_bytes: u64,
    /// Kept because the usage checker reported them in use
    pub retained_in_use: usize,
    /// Kept because they were deleted inside the inactivity window
    pub retained_recent: usize,
}

impl std::ops::AddAssign for CompactionStats {
    fn add_assign(&mut self, rhs: Self) {
        self.examined += rhs.examined;
        self.reclaimed += rhs.reclaimed;
        self.reclaimed_bytes += rhs.reclaimed_bytes;
        self.retained_in_use += rhs.retained_in_use;
        self.retained_recent += rhs.retained_recent;
    }
}

/// A blob storage backend.
///
/// Reads are served whenever the store is started, frozen or not. Writes
/// (create, delete, compact) require a started store that is not frozen.
#[async_trait]
pub trait BlobStore: Send + Sync + Debug {
    fn configuration(&self) -> BlobStoreConfiguration;

    fn name(&self) -> String {
        self.configuration().name
    }

    fn type_name(&self) -> String {
        self.configuration().type_name
    }

    /// Swap in a new configuration. Only valid while the store is not started.
    fn init(&self, config: BlobStoreConfiguration) -> Result<()>;

    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    fn state(&self) -> StoreState;

    /// Mark the store read-only.
    fn freeze(&self);

    fn unfreeze(&self);

    fn is_frozen(&self) -> bool;

    fn is_writable(&self) -> bool {
        self.state() == StoreState::Started && !self.is_frozen()
    }

    fn metrics(&self) -> StoreMetrics;

    async fn get(&self, blob: &BlobRef) -> Result<Option<Blob>>;

    async fn exists(&self, blob: &BlobRef) -> Result<bool> {
        Ok(self.get(blob).await?.is_some())
    }

    async fn create(&self, content: Bytes, headers: BlobHeaders) -> Result<Blob>;

    /// Soft delete: the blob disappears from reads immediately and its space
    /// is reclaimed by a later [`BlobStore::compact`].
    async fn delete(&self, blob: &BlobRef, reason: &str) -> Result<bool>;

    /// Physically reclaim deleted blobs whose deletion is older than
    /// `inactivity` and which `usage` reports as unused.
    async fn compact(
        &self,
        usage: &dyn UsageChecker,
        inactivity: Duration,
    ) -> Result<CompactionStats>;

    /// Remote object metadata; `None` for backends without it.
    async fn external_metadata(&self, blob: &BlobRef) -> Result<Option<ExternalMetadata>>;

    fn as_file(&self) -> Option<&FileBlobStore> {
        None
    }

    fn as_group(&self) -> Option<&BlobStoreGroup> {
        None
    }
}
