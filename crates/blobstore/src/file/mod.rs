//! Local filesystem backend.
//!
//! Blobs live under `<root>/content/<YYYY>/<MM>/<DD>/<hh>/<mm>/` as a
//! `.bytes` file with a sibling `.properties` file. Deleted blob ids are
//! appended to `<root>/deletions.index` until compaction reclaims them.

mod walker;

pub use walker::{DatePathWalker, Since};

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::{Blob, BlobHeaders, BlobId, BlobMetrics, BlobRef, ExternalMetadata};
use crate::configuration::BlobStoreConfiguration;
use crate::descriptor::{BlobStoreDescriptor, BuildContext, ValidationContext};
use crate::error::{BlobStoreError, Result};
use crate::store::layout::{self, CONTENT_DIR};
use crate::store::{
    BlobProperties, BlobStore, CompactionStats, StoreCore, StoreMetrics, StoreState,
};
use crate::usage::UsageChecker;

pub const TYPE: &str = "file";
pub const SECTION: &str = "file";
pub const PATH: &str = "path";

const DELETIONS_INDEX: &str = "deletions.index";

#[derive(Debug)]
pub struct FileBlobStore {
    core: StoreCore,
    /// Serializes compaction passes.
    compaction: tokio::sync::Mutex<()>,
    /// Guards the deletion index file.
    index: tokio::sync::Mutex<()>,
}

impl FileBlobStore {
    pub fn new(config: BlobStoreConfiguration) -> Self {
        Self {
            core: StoreCore::new(config),
            compaction: tokio::sync::Mutex::new(()),
            index: tokio::sync::Mutex::new(()),
        }
    }

    /// Root directory from the current configuration.
    pub fn root(&self) -> Result<PathBuf> {
        root_of(&self.core.configuration())
    }

    pub fn content_root(&self) -> Result<PathBuf> {
        Ok(self.root()?.join(CONTENT_DIR))
    }

    /// Ids of blobs created at or after `since`, mapped to their date path.
    pub async fn blobs_since(
        &self,
        since: Since,
        prefix: Option<&str>,
    ) -> Result<BTreeMap<BlobId, String>> {
        self.core.ensure_started()?;
        DatePathWalker::new(self.content_root()?)
            .walk(since, prefix)
            .await
    }

    /// Remove a blob immediately, bypassing the deletion index.
    pub async fn hard_delete(&self, id: &BlobId) -> Result<bool> {
        self.core.ensure_writable()?;
        let root = self.root()?;
        let bytes_path = root.join(layout::bytes_key(id));
        let size = match tokio::fs::metadata(&bytes_path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        remove_if_present(&bytes_path).await?;
        remove_if_present(&root.join(layout::properties_key(id))).await?;
        self.core.record_reclaimed(size);
        info!(store = %self.core.name(), blob = %id, "blob hard deleted");
        Ok(true)
    }

    async fn read_properties(&self, root: &Path, id: &BlobId) -> Result<Option<BlobProperties>> {
        match tokio::fs::read_to_string(root.join(layout::properties_key(id))).await {
            Ok(text) => Ok(Some(BlobProperties::decode(&text)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_properties(
        &self,
        root: &Path,
        id: &BlobId,
        properties: &BlobProperties,
    ) -> Result<()> {
        write_atomic(
            &root.join(layout::properties_key(id)),
            properties.encode().as_bytes(),
        )
        .await
    }

    async fn append_to_index(&self, root: &Path, id: &BlobId) -> Result<()> {
        let _guard = self.index.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(DELETIONS_INDEX))
            .await?;
        file.write_all(format!("{id}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_index(&self, root: &Path) -> Result<Vec<BlobId>> {
        let text = match tokio::fs::read_to_string(root.join(DELETIONS_INDEX)).await {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seen = BTreeSet::new();
        let mut ids = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.parse::<BlobId>() {
                Ok(id) if seen.insert(id.clone()) => ids.push(id),
                Ok(_) => {}
                Err(e) => warn!(store = %self.core.name(), entry = line, error = %e, "skipping malformed deletion index entry"),
            }
        }
        Ok(ids)
    }

    /// Drop reclaimed ids from the index, keeping entries appended while the
    /// compaction pass was running.
    async fn prune_index(&self, root: &Path, reclaimed: &BTreeSet<BlobId>) -> Result<()> {
        let _guard = self.index.lock().await;
        let remaining: String = self
            .read_index(root)
            .await?
            .into_iter()
            .filter(|id| !reclaimed.contains(id))
            .map(|id| format!("{id}\n"))
            .collect();
        write_atomic(&root.join(DELETIONS_INDEX), remaining.as_bytes()).await
    }

    async fn recompute_metrics(&self) -> Result<StoreMetrics> {
        let content_root = self.content_root()?;
        let blobs = DatePathWalker::new(&content_root)
            .walk(Since::Instant(DateTime::<Utc>::MIN_UTC), None)
            .await?;
        let mut metrics = StoreMetrics::default();
        for (id, date_path) in blobs {
            let path = content_root
                .join(date_path)
                .join(format!("{id}.{}", layout::BYTES_EXTENSION));
            match tokio::fs::metadata(&path).await {
                Ok(meta) => {
                    metrics.blob_count += 1;
                    metrics.total_size += meta.len();
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(metrics)
    }

    async fn try_start(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.content_root()?).await?;
        let metrics = self.recompute_metrics().await?;
        self.core.reset_metrics(metrics);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FileBlobStore {
    fn configuration(&self) -> BlobStoreConfiguration {
        self.core.configuration()
    }

    fn init(&self, config: BlobStoreConfiguration) -> Result<()> {
        root_of(&config)?;
        self.core.replace_configuration(config)
    }

    async fn start(&self) -> Result<()> {
        if self.core.state() == StoreState::Started {
            return Ok(());
        }
        match self.try_start().await {
            Ok(()) => {
                self.core.set_state(StoreState::Started);
                let metrics = self.core.metrics();
                info!(
                    store = %self.core.name(),
                    blobs = metrics.blob_count,
                    bytes = metrics.total_size,
                    "file blob store started"
                );
                Ok(())
            }
            Err(e) => {
                self.core.set_state(StoreState::Failed);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.core.set_state(StoreState::Stopped);
        debug!(store = %self.core.name(), "file blob store stopped");
        Ok(())
    }

    fn state(&self) -> StoreState {
        self.core.state()
    }

    fn freeze(&self) {
        self.core.freeze();
    }

    fn unfreeze(&self) {
        self.core.unfreeze();
    }

    fn is_frozen(&self) -> bool {
        self.core.is_frozen()
    }

    fn metrics(&self) -> StoreMetrics {
        self.core.metrics()
    }

    async fn get(&self, blob: &BlobRef) -> Result<Option<Blob>> {
        self.core.ensure_started()?;
        let root = self.root()?;
        let Some(properties) = self.read_properties(&root, &blob.blob).await? else {
            return Ok(None);
        };
        if properties.is_deleted() {
            return Ok(None);
        }
        let content = match tokio::fs::read(root.join(layout::bytes_key(&blob.blob))).await {
            Ok(content) => Bytes::from(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(store = %self.core.name(), blob = %blob.blob, "properties present without content");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Some(Blob {
            blob_ref: blob.clone(),
            headers: properties.headers,
            metrics: properties.metrics,
            content,
        }))
    }

    async fn create(&self, content: Bytes, headers: BlobHeaders) -> Result<Blob> {
        self.core.ensure_writable()?;
        headers.validate_required()?;

        let root = self.root()?;
        let created = Utc::now();
        let id = BlobId::generate(&created);
        let metrics = BlobMetrics::compute(&content, created);

        write_atomic(&root.join(layout::bytes_key(&id)), &content).await?;
        let properties = BlobProperties::new(headers, metrics);
        self.write_properties(&root, &id, &properties).await?;
        self.core.record_created(properties.metrics.size);

        debug!(
            store = %self.core.name(),
            blob = %id,
            size = properties.metrics.size,
            "blob created"
        );
        Ok(Blob {
            blob_ref: BlobRef::new(self.core.name(), id),
            headers: properties.headers,
            metrics: properties.metrics,
            content,
        })
    }

    async fn delete(&self, blob: &BlobRef, reason: &str) -> Result<bool> {
        self.core.ensure_writable()?;
        let root = self.root()?;
        let Some(mut properties) = self.read_properties(&root, &blob.blob).await? else {
            return Ok(false);
        };
        if properties.is_deleted() {
            return Ok(false);
        }
        properties.mark_deleted(Utc::now(), reason);
        self.write_properties(&root, &blob.blob, &properties).await?;
        self.append_to_index(&root, &blob.blob).await?;
        info!(store = %self.core.name(), blob = %blob.blob, reason, "blob soft deleted");
        Ok(true)
    }

    async fn compact(
        &self,
        usage: &dyn UsageChecker,
        inactivity: Duration,
    ) -> Result<CompactionStats> {
        self.core.ensure_writable()?;
        let _pass = self.compaction.lock().await;

        let name = self.core.name();
        let root = self.root()?;
        let cutoff = Since::Duration(inactivity).cutoff(Utc::now());
        let mut stats = CompactionStats::default();
        let mut reclaimed = BTreeSet::new();

        for id in self.read_index(&root).await? {
            let properties = match self.read_properties(&root, &id).await? {
                Some(properties) => properties,
                None => {
                    reclaimed.insert(id);
                    continue;
                }
            };
            let Some(mark) = &properties.deleted else {
                reclaimed.insert(id);
                continue;
            };
            stats.examined += 1;

            if mark.at > cutoff {
                stats.retained_recent += 1;
                continue;
            }
            let blob_ref = BlobRef::new(name.clone(), id.clone());
            if usage.is_blob_in_use(&blob_ref).await? {
                debug!(store = %name, blob = %id, "deleted blob still in use, retained");
                stats.retained_in_use += 1;
                continue;
            }

            remove_if_present(&root.join(layout::bytes_key(&id))).await?;
            remove_if_present(&root.join(layout::properties_key(&id))).await?;
            self.core.record_reclaimed(properties.metrics.size);
            stats.reclaimed += 1;
            stats.reclaimed_bytes += properties.metrics.size;
            reclaimed.insert(id);
        }

        self.prune_index(&root, &reclaimed).await?;
        info!(
            store = %name,
            examined = stats.examined,
            reclaimed = stats.reclaimed,
            bytes = stats.reclaimed_bytes,
            "file blob store compacted"
        );
        Ok(stats)
    }

    async fn external_metadata(&self, _blob: &BlobRef) -> Result<Option<ExternalMetadata>> {
        Ok(None)
    }

    fn as_file(&self) -> Option<&FileBlobStore> {
        Some(self)
    }
}

fn root_of(config: &BlobStoreConfiguration) -> Result<PathBuf> {
    config
        .string_attribute(SECTION, PATH)
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .ok_or_else(|| {
            BlobStoreError::configuration(format!(
                "blob store '{}' requires attribute '{SECTION}.{PATH}'",
                config.name
            ))
        })
}

/// Write through a temporary sibling and rename into place.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob");
    let temp = path.with_file_name(format!("{file_name}.{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&temp, data).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn remove_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Validates and builds `file` stores.
#[derive(Debug, Default)]
pub struct FileDescriptor;

impl BlobStoreDescriptor for FileDescriptor {
    fn type_name(&self) -> &'static str {
        TYPE
    }

    fn validate(&self, config: &BlobStoreConfiguration, _ctx: &ValidationContext<'_>) -> Result<()> {
        root_of(config).map(|_| ())
    }

    fn build(
        &self,
        config: BlobStoreConfiguration,
        _ctx: &BuildContext,
    ) -> Result<Arc<dyn BlobStore>> {
        Ok(Arc::new(FileBlobStore::new(config)))
    }
}
