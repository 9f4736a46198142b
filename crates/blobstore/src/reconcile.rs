//! Fills in cached remote-object metadata for assets stored on remote
//! backends.
//!
//! For every repository whose store (or, for a group, any member) satisfies
//! the support predicate, assets are paged through. An asset whose blob has
//! no cached [`ExternalMetadata`] triggers one backend lookup; a returned
//! value is persisted against the asset. Failures of single assets are logged
//! and counted without stopping the batch.

use std::fmt;
use std::ops::AddAssign;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::blob::{BlobRef, ExternalMetadata};
use crate::cloud;
use crate::configuration::BlobStoreConfiguration;
use crate::error::Result;
use crate::manager::BlobStoreManager;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub name: String,
    /// Name of the store (or group) holding the repository's blobs.
    pub blob_store: String,
}

/// Lists the repositories to consider.
#[async_trait]
pub trait RepositoryCatalog: Send + Sync {
    async fn repositories(&self) -> anyhow::Result<Vec<RepositoryInfo>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetBlob {
    pub blob_ref: BlobRef,
    pub external_metadata: Option<ExternalMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRecord {
    pub id: String,
    pub path: String,
    pub blob: Option<AssetBlob>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetPage {
    pub assets: Vec<AssetRecord>,
    /// Token for the next page; `None` on the last page.
    pub continuation: Option<String>,
}

/// Repository asset persistence.
#[async_trait]
pub trait AssetStore: Send + Sync {
    async fn browse(
        &self,
        repository: &str,
        continuation: Option<&str>,
        limit: usize,
    ) -> anyhow::Result<AssetPage>;

    async fn set_external_metadata(
        &self,
        repository: &str,
        asset_id: &str,
        blob: &BlobRef,
        metadata: &ExternalMetadata,
    ) -> anyhow::Result<()>;
}

/// Decides whether a concrete (non-group) store carries remote metadata.
pub type SupportPredicate = Arc<dyn Fn(&BlobStoreConfiguration) -> bool + Send + Sync>;

/// Only the object storage backend.
pub fn cloud_only() -> SupportPredicate {
    Arc::new(|config: &BlobStoreConfiguration| config.type_name == cloud::TYPE)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSettings {
    pub page_size: usize,
    /// Repositories processed at once
    pub concurrency: usize,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub repositories: usize,
    pub scanned: usize,
    /// Assets without a blob, already cached, or without remote metadata
    pub skipped: usize,
    pub updated: usize,
    pub failed: usize,
}

impl AddAssign for ReconcileStats {
    fn add_assign(&mut self, rhs: Self) {
        self.repositories += rhs.repositories;
        self.scanned += rhs.scanned;
        self.skipped += rhs.skipped;
        self.updated += rhs.updated;
        self.failed += rhs.failed;
    }
}

pub struct ExternalMetadataReconciler {
    manager: BlobStoreManager,
    catalog: Arc<dyn RepositoryCatalog>,
    assets: Arc<dyn AssetStore>,
    supported: SupportPredicate,
    settings: ReconcileSettings,
}

impl fmt::Debug for ExternalMetadataReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalMetadataReconciler")
            .field("manager", &self.manager)
            .field("settings", &self.settings)
            .finish()
    }
}

impl ExternalMetadataReconciler {
    pub fn new(
        manager: BlobStoreManager,
        catalog: Arc<dyn RepositoryCatalog>,
        assets: Arc<dyn AssetStore>,
    ) -> Self {
        Self {
            manager,
            catalog,
            assets,
            supported: cloud_only(),
            settings: ReconcileSettings::default(),
        }
    }

    pub fn with_predicate(mut self, supported: SupportPredicate) -> Self {
        self.supported = supported;
        self
    }

    pub fn with_settings(mut self, settings: ReconcileSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Whether a repository stored in `store` needs reconciliation. Groups
    /// qualify when any member does.
    pub fn applies_to(&self, store: &str) -> bool {
        let Some(store) = self.manager.get(store) else {
            return false;
        };
        match store.as_group() {
            Some(group) => group
                .members()
                .iter()
                .filter_map(|member| self.manager.get(member))
                .any(|member| (self.supported)(&member.configuration())),
            None => (self.supported)(&store.configuration()),
        }
    }

    /// Reconcile every applicable repository.
    pub async fn run(&self) -> Result<ReconcileStats> {
        let repositories: Vec<RepositoryInfo> = self
            .catalog
            .repositories()
            .await?
            .into_iter()
            .filter(|repo| self.applies_to(&repo.blob_store))
            .collect();
        info!(repositories = repositories.len(), "reconciling external metadata");

        let results: Vec<_> = futures::stream::iter(repositories)
            .map(|repo| async move {
                let result = self.reconcile_repository(&repo).await;
                (repo.name, result)
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        let mut total = ReconcileStats::default();
        for (repository, result) in results {
            match result {
                Ok(stats) => total += stats,
                Err(e) => {
                    error!(repository = %repository, error = %e, "external metadata reconciliation failed");
                    total.failed += 1;
                }
            }
        }
        info!(
            repositories = total.repositories,
            scanned = total.scanned,
            updated = total.updated,
            failed = total.failed,
            "external metadata reconciliation finished"
        );
        Ok(total)
    }

    /// Page through one repository. A failed page read aborts the
    /// repository; a failed asset does not.
    pub async fn reconcile_repository(&self, repository: &RepositoryInfo) -> Result<ReconcileStats> {
        let mut stats = ReconcileStats {
            repositories: 1,
            ..Default::default()
        };
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .assets
                .browse(
                    &repository.name,
                    continuation.as_deref(),
                    self.settings.page_size.max(1),
                )
                .await?;
            let last_page = page.continuation.is_none() || page.assets.is_empty();

            for asset in page.assets {
                stats.scanned += 1;
                match asset.blob {
                    Some(AssetBlob {
                        blob_ref,
                        external_metadata: None,
                    }) => {
                        self.reconcile_asset(&repository.name, &asset.id, &blob_ref, &mut stats)
                            .await
                    }
                    _ => stats.skipped += 1,
                }
            }

            if last_page {
                break;
            }
            continuation = page.continuation;
        }

        debug!(repository = %repository.name, scanned = stats.scanned, updated = stats.updated, "repository reconciled");
        Ok(stats)
    }

    async fn reconcile_asset(
        &self,
        repository: &str,
        asset_id: &str,
        blob_ref: &BlobRef,
        stats: &mut ReconcileStats,
    ) {
        let Some(store) = self.manager.get(&blob_ref.store) else {
            warn!(repository, asset = asset_id, blob = %blob_ref, "blob store of asset not found");
            stats.failed += 1;
            return;
        };
        let metadata = match store.external_metadata(blob_ref).await {
            Ok(Some(metadata)) => metadata,
            Ok(None) => {
                stats.skipped += 1;
                return;
            }
            Err(e) => {
                warn!(repository, asset = asset_id, blob = %blob_ref, error = %e, "unable to fetch external metadata");
                stats.failed += 1;
                return;
            }
        };
        match self
            .assets
            .set_external_metadata(repository, asset_id, blob_ref, &metadata)
            .await
        {
            Ok(()) => stats.updated += 1,
            Err(e) => {
                warn!(repository, asset = asset_id, error = %e, "unable to persist external metadata");
                stats.failed += 1;
            }
        }
    }
}
