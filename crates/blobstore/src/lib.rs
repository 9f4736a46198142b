//! Blob storage engine for an artifact repository manager.
//!
//! Binary artifact content is stored as immutable blobs in pluggable
//! backends and addressed by [`BlobRef`] (`<store>@<blobId>`).
//!
//! # Features
//!
//! - File backend with date-partitioned layout and a walker that finds recent
//!   blobs without scanning the whole tree
//! - Object storage backend (S3 compatible, local, in-memory) with remote
//!   metadata lookup
//! - Groups that spread writes across members with soft-quota aware selection
//! - A manager that validates, persists, starts and publishes stores, rolls
//!   back failed updates and freezes everything for coordinated upgrades
//! - Compaction and external metadata reconciliation on bounded worker pools
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use blobstore::{
//!     blob::headers, BlobHeaders, BlobStoreConfiguration, BlobStoreManager,
//!     SqliteConfigurationStore,
//! };
//!
//! # async fn example() -> Result<(), blobstore::BlobStoreError> {
//! let configs = SqliteConfigurationStore::new("/var/lib/depot/stores.db").await?;
//! let manager = BlobStoreManager::builder(Arc::new(configs)).build();
//! manager.start().await?;
//!
//! let store = manager
//!     .create(
//!         BlobStoreConfiguration::new("default", "file")
//!             .with_attribute("file", "path", "/var/lib/depot/blobs/default"),
//!     )
//!     .await?;
//!
//! let blob = store
//!     .create(
//!         bytes::Bytes::from_static(b"hello world"),
//!         BlobHeaders::new()
//!             .with(headers::BLOB_NAME, "hello.txt")
//!             .with(headers::CREATED_BY, "admin"),
//!     )
//!     .await?;
//! println!("stored {}", blob.blob_ref);
//! # Ok(())
//! # }
//! ```

pub mod blob;
pub mod cloud;
pub mod compaction;
pub mod configuration;
pub mod descriptor;
mod error;
pub mod file;
pub mod group;
pub mod manager;
pub mod partition;
pub mod pool;
pub mod quota;
pub mod reconcile;
pub mod registry;
pub mod store;
pub mod usage;

pub use blob::{Blob, BlobHeaders, BlobId, BlobMetrics, BlobRef, ExternalMetadata};
pub use compaction::{
    CompactionCoordinator, CompactionOutcome, CompactionSettings, MoveRecord, MoveTracker,
    NoMoves, StoreSelection, TaskClaims,
};
pub use configuration::{
    BlobStoreConfiguration, ConfigurationStore, MemoryConfigurationStore,
    SqliteConfigurationStore,
};
pub use descriptor::{BlobStoreDescriptor, DescriptorRegistry};
pub use error::{BlobStoreError, Result};
pub use file::{DatePathWalker, FileBlobStore, Since};
pub use group::BlobStoreGroup;
pub use manager::{BlobStoreEvent, BlobStoreManager};
pub use reconcile::{
    AssetBlob, AssetPage, AssetRecord, AssetStore, ExternalMetadataReconciler, ReconcileSettings,
    ReconcileStats, RepositoryCatalog, RepositoryInfo,
};
pub use store::{BlobStore, CompactionStats, StoreMetrics, StoreState};
pub use usage::{NoUsage, UsageChecker};
