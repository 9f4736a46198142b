//! Object storage backend (S3 compatible, local directory or in-memory),
//! built on the `object_store` crate.
//!
//! Uses the same `content/<date path>/<id>.{bytes,properties}` layout as the
//! file backend beneath an optional key prefix. Soft deletions are recorded as
//! marker objects under `deletions/<id>`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::blob::{Blob, BlobHeaders, BlobId, BlobMetrics, BlobRef, ExternalMetadata};
use crate::configuration::BlobStoreConfiguration;
use crate::descriptor::{BlobStoreDescriptor, BuildContext, ValidationContext};
use crate::error::{BlobStoreError, Result};
use crate::file::Since;
use crate::store::layout::{self, BYTES_EXTENSION, CONTENT_DIR};
use crate::store::{
    BlobProperties, BlobStore, CompactionStats, StoreCore, StoreMetrics, StoreState,
};
use crate::usage::UsageChecker;

pub const TYPE: &str = "cloud";
pub const SECTION: &str = "cloud";

pub const PROVIDER: &str = "provider";
pub const BUCKET: &str = "bucket";
pub const ENDPOINT: &str = "endpoint";
pub const REGION: &str = "region";
pub const ACCESS_KEY_ID: &str = "accessKeyId";
pub const SECRET_ACCESS_KEY: &str = "secretAccessKey";
pub const PREFIX: &str = "prefix";
pub const PATH: &str = "path";

const DELETIONS_DIR: &str = "deletions";
const SECRETS: &[(&str, &str)] = &[(SECTION, SECRET_ACCESS_KEY)];

/// Where the objects live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    S3,
    Local,
    Memory,
}

impl Provider {
    fn from_config(config: &BlobStoreConfiguration) -> Result<Self> {
        match config.string_attribute(SECTION, PROVIDER).unwrap_or("s3") {
            "s3" => Ok(Provider::S3),
            "local" => Ok(Provider::Local),
            "memory" => Ok(Provider::Memory),
            other => Err(BlobStoreError::configuration(format!(
                "unknown cloud provider '{other}' for blob store '{}'",
                config.name
            ))),
        }
    }
}

/// Attributes that shape the client. A key prefix does not.
const CONNECTION: &[&str] = &[
    PROVIDER,
    BUCKET,
    ENDPOINT,
    REGION,
    ACCESS_KEY_ID,
    SECRET_ACCESS_KEY,
    PATH,
];

fn same_connection(a: &BlobStoreConfiguration, b: &BlobStoreConfiguration) -> bool {
    CONNECTION
        .iter()
        .all(|key| a.string_attribute(SECTION, key) == b.string_attribute(SECTION, key))
}

fn required<'a>(config: &'a BlobStoreConfiguration, key: &str) -> Result<&'a str> {
    config
        .string_attribute(SECTION, key)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| {
            BlobStoreError::configuration(format!(
                "blob store '{}' requires attribute '{SECTION}.{key}'",
                config.name
            ))
        })
}

/// Build the object store client described by a configuration.
async fn connect(config: &BlobStoreConfiguration) -> Result<Arc<dyn ObjectStore>> {
    match Provider::from_config(config)? {
        Provider::S3 => {
            let mut builder = AmazonS3Builder::new().with_bucket_name(required(config, BUCKET)?);
            if let Some(region) = config.string_attribute(SECTION, REGION) {
                builder = builder.with_region(region);
            }
            if let Some(endpoint) = config.string_attribute(SECTION, ENDPOINT) {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            if let Some(key) = config.string_attribute(SECTION, ACCESS_KEY_ID) {
                builder = builder.with_access_key_id(key);
            }
            if let Some(secret) = config.string_attribute(SECTION, SECRET_ACCESS_KEY) {
                builder = builder.with_secret_access_key(secret);
            }
            Ok(Arc::new(builder.build()?))
        }
        Provider::Local => {
            let path = required(config, PATH)?;
            tokio::fs::create_dir_all(path).await?;
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        Provider::Memory => Ok(Arc::new(InMemory::new())),
    }
}

#[derive(Debug)]
pub struct CloudBlobStore {
    core: StoreCore,
    backend: RwLock<Option<Arc<dyn ObjectStore>>>,
    /// Client supplied by the embedder; survives reconfiguration.
    injected: Option<Arc<dyn ObjectStore>>,
    compaction: tokio::sync::Mutex<()>,
}

impl CloudBlobStore {
    pub fn new(config: BlobStoreConfiguration) -> Self {
        Self {
            core: StoreCore::new(config),
            backend: RwLock::new(None),
            injected: None,
            compaction: tokio::sync::Mutex::new(()),
        }
    }

    /// Use an existing object store client instead of building one from the
    /// configuration.
    pub fn with_object_store(config: BlobStoreConfiguration, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            core: StoreCore::new(config),
            backend: RwLock::new(Some(store.clone())),
            injected: Some(store),
            compaction: tokio::sync::Mutex::new(()),
        }
    }

    fn backend(&self) -> Result<Arc<dyn ObjectStore>> {
        self.backend.read().clone().ok_or_else(|| BlobStoreError::NotStarted {
            name: self.core.name(),
            state: self.core.state().to_string(),
        })
    }

    fn key(&self, relative: &str) -> ObjectPath {
        let config = self.core.configuration();
        match config
            .string_attribute(SECTION, PREFIX)
            .map(|p| p.trim_matches('/'))
            .filter(|p| !p.is_empty())
        {
            Some(prefix) => ObjectPath::from(format!("{prefix}/{relative}")),
            None => ObjectPath::from(relative),
        }
    }

    fn marker_key(&self, id: &BlobId) -> ObjectPath {
        self.key(&format!("{DELETIONS_DIR}/{id}"))
    }

    async fn read_object(&self, location: &ObjectPath) -> Result<Option<Bytes>> {
        match self.backend()?.get(location).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(&self, location: &ObjectPath) -> Result<()> {
        match self.backend()?.delete(location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_properties(&self, id: &BlobId) -> Result<Option<BlobProperties>> {
        let Some(raw) = self.read_object(&self.key(&layout::properties_key(id))).await? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&raw);
        Ok(Some(BlobProperties::decode(&text)?))
    }

    async fn write_properties(&self, id: &BlobId, properties: &BlobProperties) -> Result<()> {
        self.backend()?
            .put(
                &self.key(&layout::properties_key(id)),
                Bytes::from(properties.encode()).into(),
            )
            .await?;
        Ok(())
    }

    async fn deletion_markers(&self) -> Result<Vec<BlobId>> {
        let backend = self.backend()?;
        let prefix = self.key(DELETIONS_DIR);
        let listed: Vec<_> = backend.list(Some(&prefix)).try_collect().await?;
        let mut ids: Vec<BlobId> = listed
            .iter()
            .filter_map(|meta| meta.location.filename())
            .filter_map(|name| name.parse().ok())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn recompute_metrics(&self) -> Result<StoreMetrics> {
        let backend = self.backend()?;
        let prefix = self.key(CONTENT_DIR);
        let suffix = format!(".{BYTES_EXTENSION}");
        let listed: Vec<_> = backend.list(Some(&prefix)).try_collect().await?;
        Ok(listed
            .iter()
            .filter(|meta| meta.location.as_ref().ends_with(&suffix))
            .fold(StoreMetrics::default(), |mut metrics, meta| {
                metrics.blob_count += 1;
                metrics.total_size += meta.size as u64;
                metrics
            }))
    }

    async fn try_start(&self) -> Result<()> {
        if self.backend.read().is_none() {
            let client = connect(&self.core.configuration()).await?;
            *self.backend.write() = Some(client);
        }
        let metrics = self.recompute_metrics().await?;
        self.core.reset_metrics(metrics);
        Ok(())
    }
}

#[async_trait]
impl BlobStore for CloudBlobStore {
    fn configuration(&self) -> BlobStoreConfiguration {
        self.core.configuration()
    }

    /// Keeps the current client when the connection attributes are
    /// unchanged, so an in-memory store keeps its objects across updates.
    fn init(&self, config: BlobStoreConfiguration) -> Result<()> {
        Provider::from_config(&config)?;
        let reconnect = !same_connection(&self.core.configuration(), &config);
        self.core.replace_configuration(config)?;
        if reconnect {
            *self.backend.write() = self.injected.clone();
        }
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if self.core.state() == StoreState::Started {
            return Ok(());
        }
        match self.try_start().await {
            Ok(()) => {
                self.core.set_state(StoreState::Started);
                info!(
                    store = %self.core.name(),
                    blobs = self.core.metrics().blob_count,
                    "cloud blob store started"
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
        debug!(store = %self.core.name(), "cloud blob store stopped");
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
        let Some(properties) = self.read_properties(&blob.blob).await? else {
            return Ok(None);
        };
        if properties.is_deleted() {
            return Ok(None);
        }
        let Some(content) = self.read_object(&self.key(&layout::bytes_key(&blob.blob))).await? else {
            warn!(store = %self.core.name(), blob = %blob.blob, "properties present without content");
            return Ok(None);
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

        let created = Utc::now();
        let id = BlobId::generate(&created);
        let metrics = BlobMetrics::compute(&content, created);

        self.backend()?
            .put(&self.key(&layout::bytes_key(&id)), content.clone().into())
            .await?;
        let properties = BlobProperties::new(headers, metrics);
        self.write_properties(&id, &properties).await?;
        self.core.record_created(properties.metrics.size);

        debug!(store = %self.core.name(), blob = %id, size = properties.metrics.size, "blob uploaded");
        Ok(Blob {
            blob_ref: BlobRef::new(self.core.name(), id),
            headers: properties.headers,
            metrics: properties.metrics,
            content,
        })
    }

    async fn delete(&self, blob: &BlobRef, reason: &str) -> Result<bool> {
        self.core.ensure_writable()?;
        let Some(mut properties) = self.read_properties(&blob.blob).await? else {
            return Ok(false);
        };
        if properties.is_deleted() {
            return Ok(false);
        }
        let at = Utc::now();
        properties.mark_deleted(at, reason);
        self.write_properties(&blob.blob, &properties).await?;
        self.backend()?
            .put(
                &self.marker_key(&blob.blob),
                Bytes::from(at.to_rfc3339()).into(),
            )
            .await?;
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
        let cutoff = Since::Duration(inactivity).cutoff(Utc::now());
        let mut stats = CompactionStats::default();

        for id in self.deletion_markers().await? {
            let marker = self.marker_key(&id);
            let Some(properties) = self.read_properties(&id).await? else {
                self.delete_object(&marker).await?;
                continue;
            };
            let Some(mark) = &properties.deleted else {
                self.delete_object(&marker).await?;
                continue;
            };
            stats.examined += 1;

            if mark.at > cutoff {
                stats.retained_recent += 1;
                continue;
            }
            if usage.is_blob_in_use(&BlobRef::new(name.clone(), id.clone())).await? {
                stats.retained_in_use += 1;
                continue;
            }

            self.delete_object(&self.key(&layout::bytes_key(&id))).await?;
            self.delete_object(&self.key(&layout::properties_key(&id))).await?;
            self.delete_object(&marker).await?;
            self.core.record_reclaimed(properties.metrics.size);
            stats.reclaimed += 1;
            stats.reclaimed_bytes += properties.metrics.size;
        }

        info!(
            store = %name,
            examined = stats.examined,
            reclaimed = stats.reclaimed,
            bytes = stats.reclaimed_bytes,
            "cloud blob store compacted"
        );
        Ok(stats)
    }

    async fn external_metadata(&self, blob: &BlobRef) -> Result<Option<ExternalMetadata>> {
        self.core.ensure_started()?;
        match self
            .backend()?
            .head(&self.key(&layout::bytes_key(&blob.blob)))
            .await
        {
            Ok(meta) => Ok(Some(ExternalMetadata {
                etag: meta.e_tag,
                last_modified: meta.last_modified,
            })),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Validates and builds `cloud` stores.
#[derive(Debug, Default)]
pub struct CloudDescriptor {
    object_store: Option<Arc<dyn ObjectStore>>,
}

impl CloudDescriptor {
    /// Every store built by this descriptor shares `store` instead of
    /// connecting to the configured provider.
    pub fn with_object_store(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            object_store: Some(store),
        }
    }
}

impl BlobStoreDescriptor for CloudDescriptor {
    fn type_name(&self) -> &'static str {
        TYPE
    }

    fn secret_attributes(&self) -> &'static [(&'static str, &'static str)] {
        SECRETS
    }

    fn validate(&self, config: &BlobStoreConfiguration, _ctx: &ValidationContext<'_>) -> Result<()> {
        if self.object_store.is_some() {
            return Ok(());
        }
        match Provider::from_config(config)? {
            Provider::S3 => required(config, BUCKET).map(|_| ()),
            Provider::Local => required(config, PATH).map(|_| ()),
            Provider::Memory => Ok(()),
        }
    }

    fn build(
        &self,
        config: BlobStoreConfiguration,
        _ctx: &BuildContext,
    ) -> Result<Arc<dyn BlobStore>> {
        Ok(match &self.object_store {
            Some(store) => Arc::new(CloudBlobStore::with_object_store(config, store.clone())),
            None => Arc::new(CloudBlobStore::new(config)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::headers;
    use crate::usage::NoUsage;

    fn memory_config(name: &str) -> BlobStoreConfiguration {
        BlobStoreConfiguration::new(name, TYPE)
            .with_attribute(SECTION, PROVIDER, "memory")
            .with_attribute(SECTION, PREFIX, "depot/blobs")
    }

    fn blob_headers() -> BlobHeaders {
        BlobHeaders::new()
            .with(headers::BLOB_NAME, "pkg.tgz")
            .with(headers::CREATED_BY, "ci")
    }

    async fn started() -> (CloudBlobStore, Arc<dyn ObjectStore>) {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = CloudBlobStore::with_object_store(memory_config("s3-1"), objects.clone());
        store.start().await.unwrap();
        (store, objects)
    }

    #[tokio::test]
    async fn test_create_get_and_external_metadata() {
        let (store, objects) = started().await;
        let blob = store
            .create(Bytes::from_static(b"tarball"), blob_headers())
            .await
            .unwrap();

        let location = ObjectPath::from(format!("depot/blobs/{}", layout::bytes_key(blob.id())));
        assert!(objects.head(&location).await.is_ok());

        let read = store.get(&blob.blob_ref).await.unwrap().unwrap();
        assert_eq!(read.content.as_ref(), b"tarball");

        let metadata = store.external_metadata(&blob.blob_ref).await.unwrap().unwrap();
        assert!(metadata.last_modified <= Utc::now());

        let missing = BlobRef::new("s3-1", "nothing-here".parse().unwrap());
        assert!(store.external_metadata(&missing).await.unwrap().is_none());
        assert!(store.get(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_marker_and_compaction() {
        let (store, objects) = started().await;
        let blob = store
            .create(Bytes::from_static(b"abcd"), blob_headers())
            .await
            .unwrap();
        assert!(store.delete(&blob.blob_ref, "cleanup").await.unwrap());
        assert!(store.get(&blob.blob_ref).await.unwrap().is_none());
        assert_eq!(store.deletion_markers().await.unwrap(), vec![blob.id().clone()]);

        let stats = store.compact(&NoUsage, Duration::from_secs(600)).await.unwrap();
        assert_eq!(stats.retained_recent, 1);

        let stats = store.compact(&NoUsage, Duration::ZERO).await.unwrap();
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(stats.reclaimed_bytes, 4);
        assert!(store.deletion_markers().await.unwrap().is_empty());

        let location = ObjectPath::from(format!("depot/blobs/{}", layout::bytes_key(blob.id())));
        assert!(matches!(
            objects.head(&location).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_reinit_keeps_client_unless_connection_changes() {
        let store = CloudBlobStore::new(memory_config("mem"));
        store.start().await.unwrap();
        let blob = store
            .create(Bytes::from_static(b"kept"), blob_headers())
            .await
            .unwrap();

        store.stop().await.unwrap();
        store
            .init(memory_config("mem").with_attribute("notes", "owner", "ops"))
            .unwrap();
        store.start().await.unwrap();
        assert!(store.get(&blob.blob_ref).await.unwrap().is_some());
        assert_eq!(store.metrics().blob_count, 1);

        store.stop().await.unwrap();
        store
            .init(memory_config("mem").with_attribute(SECTION, ENDPOINT, "http://other:9000"))
            .unwrap();
        store.start().await.unwrap();
        assert!(store.get(&blob.blob_ref).await.unwrap().is_none());
        assert_eq!(store.metrics().blob_count, 0);
    }

    #[tokio::test]
    async fn test_metrics_recomputed_on_start() {
        let objects: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let first = CloudBlobStore::with_object_store(memory_config("s3-1"), objects.clone());
        first.start().await.unwrap();
        first.create(Bytes::from_static(b"123"), blob_headers()).await.unwrap();
        first.create(Bytes::from_static(b"45"), blob_headers()).await.unwrap();

        let second = CloudBlobStore::with_object_store(memory_config("s3-1"), objects);
        second.start().await.unwrap();
        assert_eq!(
            second.metrics(),
            StoreMetrics {
                blob_count: 2,
                total_size: 5
            }
        );
    }

    #[tokio::test]
    async fn test_memory_provider_connects() {
        let store = CloudBlobStore::new(memory_config("mem"));
        store.start().await.unwrap();
        assert_eq!(store.state(), StoreState::Started);
    }

    #[test]
    fn test_validation() {
        let descriptor = CloudDescriptor::default();
        let registry = crate::registry::Registry::default();
        let ctx = ValidationContext {
            registry: &registry,
            previous: None,
        };

        let s3 = BlobStoreConfiguration::new("s3", TYPE).with_attribute(SECTION, PROVIDER, "s3");
        assert!(descriptor.validate(&s3, &ctx).is_err());
        let s3 = s3.with_attribute(SECTION, BUCKET, "artifacts");
        assert!(descriptor.validate(&s3, &ctx).is_ok());

        let gcs = BlobStoreConfiguration::new("g", TYPE).with_attribute(SECTION, PROVIDER, "gcs");
        assert!(matches!(
            descriptor.validate(&gcs, &ctx),
            Err(BlobStoreError::Configuration(_))
        ));
        assert_eq!(descriptor.secret_attributes(), SECRETS);
    }
}
