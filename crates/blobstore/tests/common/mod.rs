//! Shared fixtures: an instrumented in-memory backend and collaborator fakes.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use blobstore::blob::{Blob, BlobHeaders, BlobId, BlobMetrics, BlobRef, ExternalMetadata};
use blobstore::compaction::{MoveRecord, MoveTracker};
use blobstore::configuration::{BlobStoreConfiguration, ConfigurationStore, MemoryConfigurationStore};
use blobstore::descriptor::{BlobStoreDescriptor, BuildContext, DescriptorRegistry, ValidationContext};
use blobstore::store::{BlobStore, CompactionStats, StoreCore, StoreMetrics, StoreState};
use blobstore::usage::UsageChecker;
use blobstore::{BlobStoreError, BlobStoreManager, Result};
use bytes::Bytes;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;

pub const MOCK_TYPE: &str = "mock";
pub const MOCK_SECTION: &str = "mock";
/// Attribute making `start` fail.
pub const FAIL_START: &str = "failStart";

/// Calls observed across every mock store built by one descriptor.
#[derive(Debug, Default)]
pub struct Calls {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub compacted: Mutex<Vec<String>>,
    pub metadata_lookups: Mutex<Vec<BlobRef>>,
    /// Fail every start regardless of configuration.
    pub fail_all_starts: AtomicBool,
    /// Fail the next stop only.
    pub fail_next_stop: AtomicBool,
}

#[derive(Debug)]
pub struct MockStore {
    core: StoreCore,
    calls: Arc<Calls>,
    blobs: Mutex<HashMap<BlobId, Blob>>,
}

#[async_trait]
impl BlobStore for MockStore {
    fn configuration(&self) -> BlobStoreConfiguration {
        self.core.configuration()
    }

    fn init(&self, config: BlobStoreConfiguration) -> Result<()> {
        self.core.replace_configuration(config)
    }

    async fn start(&self) -> Result<()> {
        self.calls.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let configured_failure = self
            .core
            .configuration()
            .bool_attribute(MOCK_SECTION, FAIL_START)
            .unwrap_or(false);
        if configured_failure || self.calls.fail_all_starts.load(Ordering::SeqCst) {
            self.core.set_state(StoreState::Failed);
            return Err(BlobStoreError::configuration("mock start failure"));
        }
        self.core.set_state(StoreState::Started);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.calls.stops.fetch_add(1, Ordering::SeqCst);
        if self.calls.fail_next_stop.swap(false, Ordering::SeqCst) {
            return Err(BlobStoreError::configuration("mock stop failure"));
        }
        self.core.set_state(StoreState::Stopped);
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
        Ok(self.blobs.lock().get(&blob.blob).cloned())
    }

    async fn create(&self, content: Bytes, headers: BlobHeaders) -> Result<Blob> {
        self.core.ensure_writable()?;
        let created = Utc::now();
        let blob = Blob {
            blob_ref: BlobRef::new(self.core.name(), BlobId::generate(&created)),
            headers,
            metrics: BlobMetrics::compute(&content, created),
            content,
        };
        self.core.record_created(blob.metrics.size);
        self.blobs.lock().insert(blob.id().clone(), blob.clone());
        Ok(blob)
    }

    async fn delete(&self, blob: &BlobRef, _reason: &str) -> Result<bool> {
        Ok(self.blobs.lock().remove(&blob.blob).is_some())
    }

    async fn compact(
        &self,
        _usage: &dyn UsageChecker,
        _inactivity: Duration,
    ) -> Result<CompactionStats> {
        self.core.ensure_writable()?;
        self.calls.compacted.lock().push(self.core.name());
        Ok(CompactionStats::default())
    }

    async fn external_metadata(&self, blob: &BlobRef) -> Result<Option<ExternalMetadata>> {
        self.calls.metadata_lookups.lock().push(blob.clone());
        Ok(Some(mock_metadata(&blob.blob)))
    }
}

pub fn mock_metadata(id: &BlobId) -> ExternalMetadata {
    ExternalMetadata {
        etag: Some(format!("etag-{id}")),
        last_modified: Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap(),
    }
}

#[derive(Debug, Default)]
pub struct MockDescriptor {
    pub calls: Arc<Calls>,
}

impl BlobStoreDescriptor for MockDescriptor {
    fn type_name(&self) -> &'static str {
        MOCK_TYPE
    }

    fn validate(&self, _config: &BlobStoreConfiguration, _ctx: &ValidationContext<'_>) -> Result<()> {
        Ok(())
    }

    fn build(
        &self,
        config: BlobStoreConfiguration,
        _ctx: &BuildContext,
    ) -> Result<Arc<dyn BlobStore>> {
        Ok(Arc::new(MockStore {
            core: StoreCore::new(config),
            calls: self.calls.clone(),
            blobs: Mutex::new(HashMap::new()),
        }))
    }
}

/// Counts successful saves on top of the in-memory store.
#[derive(Debug, Default)]
pub struct CountingConfigurationStore {
    pub inner: MemoryConfigurationStore,
    /// Let a create overwrite an existing entry, leaving duplicate
    /// detection to the registry.
    pub allow_duplicates: AtomicBool,
    pub creates: AtomicUsize,
    pub updates: AtomicUsize,
    pub deletes: AtomicUsize,
}

#[async_trait]
impl ConfigurationStore for CountingConfigurationStore {
    async fn list(&self) -> Result<Vec<BlobStoreConfiguration>> {
        self.inner.list().await
    }

    async fn read(&self, name: &str) -> Result<Option<BlobStoreConfiguration>> {
        self.inner.read(name).await
    }

    async fn create(&self, config: &BlobStoreConfiguration) -> Result<()> {
        let overwrite = self.allow_duplicates.load(Ordering::SeqCst)
            && self.inner.read(&config.name).await?.is_some();
        if overwrite {
            self.inner.update(config).await?;
        } else {
            self.inner.create(config).await?;
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, config: &BlobStoreConfiguration) -> Result<()> {
        self.inner.update(config).await?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let deleted = self.inner.delete(name).await?;
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(deleted)
    }
}

/// Reports the listed stores as in use; blobs never are.
#[derive(Debug, Default)]
pub struct StaticUsage {
    pub stores: Vec<String>,
}

#[async_trait]
impl UsageChecker for StaticUsage {
    async fn is_store_in_use(&self, store: &str) -> anyhow::Result<bool> {
        Ok(self.stores.iter().any(|s| s.eq_ignore_ascii_case(store)))
    }

    async fn is_blob_in_use(&self, _blob: &BlobRef) -> anyhow::Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Default)]
pub struct StaticMoves {
    pub records: Vec<MoveRecord>,
}

#[async_trait]
impl MoveTracker for StaticMoves {
    async fn unfinished_moves(&self) -> anyhow::Result<Vec<MoveRecord>> {
        Ok(self.records.clone())
    }
}

pub struct TestEnv {
    pub manager: BlobStoreManager,
    pub configs: Arc<CountingConfigurationStore>,
    pub calls: Arc<Calls>,
}

pub fn setup(usage: StaticUsage) -> TestEnv {
    let configs = Arc::new(CountingConfigurationStore::default());
    let descriptor = MockDescriptor::default();
    let calls = descriptor.calls.clone();
    let manager = BlobStoreManager::builder(configs.clone())
        .descriptors(DescriptorRegistry::with_defaults().with(descriptor))
        .usage_checker(Arc::new(usage))
        .build();
    TestEnv {
        manager,
        configs,
        calls,
    }
}

pub fn mock_config(name: &str) -> BlobStoreConfiguration {
    BlobStoreConfiguration::new(name, MOCK_TYPE).with_attribute(MOCK_SECTION, "generation", 1)
}

pub async fn create_mocks(env: &TestEnv, names: &[&str]) {
    for name in names {
        env.manager.create(mock_config(name)).await.unwrap();
    }
}
