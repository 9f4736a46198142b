//! The registry and lifecycle authority for blob stores.
//!
//! [`BlobStoreManager`] owns every live store instance and the global freeze
//! flag. Lookups are lock-free reads of the registry. Create, update, delete,
//! freeze and unfreeze are serialized by one lifecycle lock so duplicate and
//! freeze decisions cannot interleave.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};

use crate::blob::{Blob, BlobRef};
use crate::configuration::{BlobStoreConfiguration, ConfigurationStore};
use crate::descriptor::{BlobStoreDescriptor, BuildContext, DescriptorRegistry, ValidationContext};
use crate::error::{BlobStoreError, Result};
use crate::group;
use crate::registry::Registry;
use crate::store::{BlobStore, StoreState};
use crate::usage::{NoUsage, UsageChecker};

const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Configuration changes announced to the rest of the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobStoreEvent {
    Created(String),
    Updated(String),
    Deleted(String),
}

/// Where an update came from. Replicated changes are applied without
/// re-announcing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChangeOrigin {
    Local,
    Replicated,
}

pub struct BlobStoreManagerBuilder {
    config_store: Arc<dyn ConfigurationStore>,
    descriptors: DescriptorRegistry,
    usage: Arc<dyn UsageChecker>,
    event_capacity: usize,
}

impl BlobStoreManagerBuilder {
    pub fn descriptors(mut self, descriptors: DescriptorRegistry) -> Self {
        self.descriptors = descriptors;
        self
    }

    pub fn usage_checker(mut self, usage: Arc<dyn UsageChecker>) -> Self {
        self.usage = usage;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn build(self) -> BlobStoreManager {
        let (events, _) = broadcast::channel(self.event_capacity);
        BlobStoreManager {
            inner: Arc::new(Inner {
                registry: Registry::new(),
                descriptors: self.descriptors,
                config_store: self.config_store,
                usage: self.usage,
                lifecycle: Mutex::new(()),
                frozen: AtomicBool::new(false),
                events,
            }),
        }
    }
}

struct Inner {
    registry: Registry,
    descriptors: DescriptorRegistry,
    config_store: Arc<dyn ConfigurationStore>,
    usage: Arc<dyn UsageChecker>,
    lifecycle: Mutex<()>,
    frozen: AtomicBool,
    events: broadcast::Sender<BlobStoreEvent>,
}

/// Cheap to clone; clones share the same registry.
#[derive(Clone)]
pub struct BlobStoreManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for BlobStoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobStoreManager")
            .field("stores", &self.inner.registry.len())
            .field("frozen", &self.is_frozen())
            .field("types", &self.inner.descriptors.types())
            .finish()
    }
}

impl BlobStoreManager {
    pub fn builder(config_store: Arc<dyn ConfigurationStore>) -> BlobStoreManagerBuilder {
        BlobStoreManagerBuilder {
            config_store,
            descriptors: DescriptorRegistry::with_defaults(),
            usage: Arc::new(NoUsage),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }

    /// Load and start every persisted store. Plain stores come up before
    /// groups so members resolve. A store that fails to start is still
    /// published, in the `Failed` state.
    pub async fn start(&self) -> Result<()> {
        let configs = self.inner.config_store.list().await?;
        let (groups, plain): (Vec<_>, Vec<_>) = configs
            .into_iter()
            .partition(|config| config.type_name == group::TYPE);

        let _guard = self.inner.lifecycle.lock().await;
        for config in plain.into_iter().chain(groups) {
            let name = config.name.clone();
            let store = match self
                .inner
                .descriptors
                .get(&config.type_name)
                .and_then(|descriptor| descriptor.build(config, &self.build_context()))
            {
                Ok(store) => store,
                Err(e) => {
                    error!(store = %name, error = %e, "unable to restore blob store");
                    continue;
                }
            };
            if let Err(e) = store.start().await {
                error!(store = %name, error = %e, "blob store failed to start");
            }
            if self.is_frozen() {
                store.freeze();
            }
            if self.inner.registry.insert_if_absent(store).is_err() {
                warn!(store = %name, "blob store already registered, skipping");
            }
        }
        info!(stores = self.inner.registry.len(), "blob store manager started");
        Ok(())
    }

    /// Stop every store. Errors are logged.
    pub async fn stop(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        for store in self.inner.registry.list() {
            if let Err(e) = store.stop().await {
                warn!(store = %store.name(), error = %e, "error stopping blob store");
            }
        }
        info!("blob store manager stopped");
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BlobStore>> {
        self.inner.registry.get(name)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.registry.contains(name)
    }

    /// Every registered store, sorted by name.
    pub fn browse(&self) -> Vec<Arc<dyn BlobStore>> {
        self.inner.registry.list()
    }

    pub fn require(&self, name: &str) -> Result<Arc<dyn BlobStore>> {
        self.get(name)
            .ok_or_else(|| BlobStoreError::NotFound(name.to_string()))
    }

    pub async fn get_blob(&self, blob: &BlobRef) -> Result<Option<Blob>> {
        self.require(&blob.store)?.get(blob).await
    }

    /// Configuration with secret attributes masked.
    pub fn configuration(&self, name: &str) -> Option<BlobStoreConfiguration> {
        self.get(name).map(|store| self.redact(store.configuration()))
    }

    pub fn configurations(&self) -> Vec<BlobStoreConfiguration> {
        self.browse()
            .iter()
            .map(|store| self.redact(store.configuration()))
            .collect()
    }

    pub fn descriptors(&self) -> &DescriptorRegistry {
        &self.inner.descriptors
    }

    pub fn usage_checker(&self) -> Arc<dyn UsageChecker> {
        self.inner.usage.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BlobStoreEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    /// Validate, persist, build and start a new store, then publish it.
    ///
    /// A store created while the manager is frozen is frozen before it
    /// becomes visible. When two callers race on one name exactly one
    /// instance is published; the other gets
    /// [`BlobStoreError::DuplicateStore`].
    pub async fn create(&self, config: BlobStoreConfiguration) -> Result<Arc<dyn BlobStore>> {
        let descriptor = self.inner.descriptors.validate(
            &config,
            &ValidationContext {
                registry: &self.inner.registry,
                previous: None,
            },
        )?;
        self.inner.config_store.create(&config).await?;

        let store = match self.build_and_start(descriptor.as_ref(), config.clone()).await {
            Ok(store) => store,
            Err(e) => {
                warn!(store = %config.name, error = %e, "blob store failed to start, discarding configuration");
                if let Err(cleanup) = self.inner.config_store.delete(&config.name).await {
                    error!(store = %config.name, error = %cleanup, "unable to remove configuration of failed blob store");
                }
                return Err(e);
            }
        };

        let published = {
            let _guard = self.inner.lifecycle.lock().await;
            if self.is_frozen() {
                store.freeze();
            }
            self.inner.registry.insert_if_absent(store.clone())
        };
        if let Err(loser) = published {
            warn!(store = %config.name, "lost blob store creation race, stopping duplicate instance");
            if let Err(e) = loser.stop().await {
                warn!(store = %config.name, error = %e, "error stopping duplicate blob store");
            }
            return Err(BlobStoreError::DuplicateStore(config.name));
        }

        info!(store = %config.name, kind = %config.type_name, frozen = store.is_frozen(), "blob store created");
        self.post(BlobStoreEvent::Created(config.name));
        Ok(store)
    }

    /// Replace a store's configuration and restart it if it was running.
    /// Refused while the manager is frozen.
    ///
    /// If the restart fails the previous configuration is restored, persisted
    /// and started again; the original failure is returned. A failure of that
    /// second start is returned instead.
    pub async fn update(&self, config: BlobStoreConfiguration) -> Result<Arc<dyn BlobStore>> {
        self.update_with(config, ChangeOrigin::Local).await
    }

    /// Apply a change received from another node without re-announcing it.
    /// Applied even while frozen so this node does not diverge.
    pub async fn update_replicated(
        &self,
        config: BlobStoreConfiguration,
    ) -> Result<Arc<dyn BlobStore>> {
        self.update_with(config, ChangeOrigin::Replicated).await
    }

    async fn update_with(
        &self,
        mut config: BlobStoreConfiguration,
        origin: ChangeOrigin,
    ) -> Result<Arc<dyn BlobStore>> {
        let _guard = self.inner.lifecycle.lock().await;
        let store = self.require(&config.name)?;
        if origin == ChangeOrigin::Local && self.is_frozen() {
            return Err(BlobStoreError::Frozen(store.name()));
        }
        let previous = store.configuration();

        let descriptor = self.inner.descriptors.get(&config.type_name)?;
        config.restore_secrets(&previous, descriptor.secret_attributes());
        self.inner.descriptors.validate(
            &config,
            &ValidationContext {
                registry: &self.inner.registry,
                previous: Some(&previous),
            },
        )?;
        self.inner.config_store.update(&config).await?;

        match store.state() {
            StoreState::Started => {
                if let Err(e) = store.stop().await {
                    warn!(store = %config.name, error = %e, "stop failed during update, restoring previous configuration");
                    self.inner.config_store.update(&previous).await?;
                    return Err(e);
                }
                if let Err(e) = store.init(config.clone()) {
                    warn!(store = %config.name, error = %e, "configuration rejected during update, restoring previous configuration");
                    self.inner.config_store.update(&previous).await?;
                    store.start().await?;
                    return Err(e);
                }
                if let Err(e) = store.start().await {
                    warn!(store = %config.name, error = %e, "restart failed after update, restoring previous configuration");
                    store.init(previous.clone())?;
                    self.inner.config_store.update(&previous).await?;
                    store.start().await?;
                    return Err(e);
                }
            }
            StoreState::Failed => {
                if let Err(e) = store.init(config.clone()) {
                    self.inner.config_store.update(&previous).await?;
                    return Err(e);
                }
                store.start().await?;
            }
            StoreState::New | StoreState::Stopped => {
                if let Err(e) = store.init(config.clone()) {
                    self.inner.config_store.update(&previous).await?;
                    return Err(e);
                }
            }
        }

        info!(store = %config.name, replicated = (origin == ChangeOrigin::Replicated), "blob store updated");
        if origin == ChangeOrigin::Local {
            self.post(BlobStoreEvent::Updated(config.name));
        }
        Ok(store)
    }

    /// Shut down and forget a store. Refused while the manager is frozen,
    /// while the usage checker reports it in use or while it is a group
    /// member.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;
        let store = self.require(name)?;
        let name = store.name();
        if self.is_frozen() {
            return Err(BlobStoreError::Frozen(name));
        }

        if self.inner.usage.is_store_in_use(&name).await? {
            return Err(BlobStoreError::in_use(&name, "referenced by a repository"));
        }
        if let Some(owner) = self
            .inner
            .registry
            .list()
            .into_iter()
            .find(|other| other.as_group().is_some_and(|g| g.contains_member(&name)))
        {
            return Err(BlobStoreError::in_use(
                &name,
                format!("member of group '{}'", owner.name()),
            ));
        }

        self.inner.registry.remove(&name);
        if let Err(e) = store.stop().await {
            warn!(store = %name, error = %e, "error stopping deleted blob store");
        }
        self.inner.config_store.delete(&name).await?;

        info!(store = %name, "blob store deleted");
        self.post(BlobStoreEvent::Deleted(name));
        Ok(())
    }

    /// Make every store read-only. Idempotent.
    pub async fn freeze(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.frozen.store(true, Ordering::SeqCst);
        for store in self.inner.registry.list() {
            store.freeze();
        }
        info!("blob store manager frozen");
    }

    pub async fn unfreeze(&self) {
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.frozen.store(false, Ordering::SeqCst);
        for store in self.inner.registry.list() {
            store.unfreeze();
        }
        info!("blob store manager unfrozen");
    }

    fn build_context(&self) -> BuildContext {
        BuildContext {
            registry: self.inner.registry.downgrade(),
        }
    }

    async fn build_and_start(
        &self,
        descriptor: &dyn BlobStoreDescriptor,
        config: BlobStoreConfiguration,
    ) -> Result<Arc<dyn BlobStore>> {
        let store = descriptor.build(config, &self.build_context())?;
        store.start().await?;
        Ok(store)
    }

    fn redact(&self, config: BlobStoreConfiguration) -> BlobStoreConfiguration {
        match self.inner.descriptors.get(&config.type_name) {
            Ok(descriptor) => config.redacted(descriptor.secret_attributes()),
            Err(_) => config,
        }
    }

    fn post(&self, event: BlobStoreEvent) {
        // No subscribers is not an error.
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{self, CloudDescriptor};
    use crate::configuration::{MemoryConfigurationStore, SECRET_PLACEHOLDER};
    use crate::file;
    use object_store::memory::InMemory;
    use serde_json::json;

    fn file_config(name: &str, root: &std::path::Path) -> BlobStoreConfiguration {
        BlobStoreConfiguration::new(name, file::TYPE).with_attribute(
            file::SECTION,
            file::PATH,
            root.join(name).to_string_lossy().to_string(),
        )
    }

    fn manager() -> (BlobStoreManager, Arc<MemoryConfigurationStore>) {
        let configs = Arc::new(MemoryConfigurationStore::new());
        let manager = BlobStoreManager::builder(configs.clone())
            .descriptors(
                DescriptorRegistry::with_defaults()
                    .with(CloudDescriptor::with_object_store(Arc::new(InMemory::new()))),
            )
            .build();
        (manager, configs)
    }

    #[tokio::test]
    async fn test_create_publishes_started_store() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (manager, configs) = manager();
        let mut events = manager.subscribe();

        let store = manager
            .create(file_config("Default", temp_dir.path()))
            .await
            .unwrap();
        assert_eq!(store.state(), StoreState::Started);
        assert!(manager.exists("default"));
        assert_eq!(configs.len(), 1);
        assert_eq!(
            events.recv().await.unwrap(),
            BlobStoreEvent::Created("Default".into())
        );
    }

    #[tokio::test]
    async fn test_unknown_type_mutates_nothing() {
        let (manager, configs) = manager();
        let result = manager
            .create(BlobStoreConfiguration::new("x", "azure"))
            .await;
        assert!(matches!(result, Err(BlobStoreError::Configuration(_))));
        assert!(configs.is_empty());
        assert!(!manager.exists("x"));
    }

    #[tokio::test]
    async fn test_failed_start_discards_configuration() {
        let (manager, configs) = manager();
        let temp_dir = tempfile::tempdir().unwrap();
        let blocker = temp_dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let config = BlobStoreConfiguration::new("broken", file::TYPE).with_attribute(
            file::SECTION,
            file::PATH,
            blocker.to_string_lossy().to_string(),
        );

        assert!(manager.create(config).await.is_err());
        assert!(configs.is_empty());
        assert!(!manager.exists("broken"));
    }

    #[tokio::test]
    async fn test_freeze_covers_existing_and_new_stores() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager();
        let before = manager.create(file_config("a", temp_dir.path())).await.unwrap();

        manager.freeze().await;
        manager.freeze().await;
        assert!(manager.is_frozen());
        assert!(before.is_frozen());

        let during = manager.create(file_config("b", temp_dir.path())).await.unwrap();
        assert!(during.is_frozen());
        assert!(!during.is_writable());

        manager.unfreeze().await;
        manager.unfreeze().await;
        assert!(!before.is_frozen());
        assert!(!during.is_frozen());
    }

    #[tokio::test]
    async fn test_update_restarts_with_new_configuration() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (manager, configs) = manager();
        manager.create(file_config("a", temp_dir.path())).await.unwrap();
        let mut events = manager.subscribe();

        let moved = BlobStoreConfiguration::new("A", file::TYPE).with_attribute(
            file::SECTION,
            file::PATH,
            temp_dir.path().join("moved").to_string_lossy().to_string(),
        );
        let store = manager.update(moved.clone()).await.unwrap();
        assert_eq!(store.state(), StoreState::Started);
        assert_eq!(store.configuration(), moved);
        assert_eq!(configs.read("a").await.unwrap(), Some(moved.clone()));
        assert_eq!(events.recv().await.unwrap(), BlobStoreEvent::Updated("A".into()));

        manager.update_replicated(moved).await.unwrap();
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_secrets_are_masked_and_preserved() {
        let (manager, configs) = manager();
        let config = BlobStoreConfiguration::new("s3", cloud::TYPE)
            .with_attribute(cloud::SECTION, cloud::BUCKET, "artifacts")
            .with_attribute(cloud::SECTION, cloud::SECRET_ACCESS_KEY, "hunter2");
        manager.create(config).await.unwrap();

        let shown = manager.configuration("S3").unwrap();
        assert_eq!(
            shown.string_attribute(cloud::SECTION, cloud::SECRET_ACCESS_KEY),
            Some(SECRET_PLACEHOLDER)
        );

        let edited = shown.with_attribute(cloud::SECTION, cloud::BUCKET, "artifacts-2");
        manager.update(edited).await.unwrap();
        let stored = configs.read("s3").await.unwrap().unwrap();
        assert_eq!(
            stored.string_attribute(cloud::SECTION, cloud::SECRET_ACCESS_KEY),
            Some("hunter2")
        );
        assert_eq!(
            stored.string_attribute(cloud::SECTION, cloud::BUCKET),
            Some("artifacts-2")
        );
    }

    #[tokio::test]
    async fn test_group_member_cannot_be_deleted() {
        let temp_dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager();
        manager.create(file_config("a", temp_dir.path())).await.unwrap();
        manager
            .create(
                BlobStoreConfiguration::new("grp", group::TYPE)
                    .with_attribute(group::SECTION, group::MEMBERS, json!(["a"])),
            )
            .await
            .unwrap();

        assert!(matches!(
            manager.delete("a").await,
            Err(BlobStoreError::InUse { .. })
        ));
        manager.delete("grp").await.unwrap();
        manager.delete("a").await.unwrap();
        assert!(manager.browse().is_empty());
    }

    #[tokio::test]
    async fn test_start_restores_persisted_stores() {
        let temp_dir = tempfile::tempdir().unwrap();
        let configs = Arc::new(MemoryConfigurationStore::new());
        configs
            .create(
                &BlobStoreConfiguration::new("grp", group::TYPE)
                    .with_attribute(group::SECTION, group::MEMBERS, json!(["a"])),
            )
            .await
            .unwrap();
        configs.create(&file_config("a", temp_dir.path())).await.unwrap();
        configs
            .create(&BlobStoreConfiguration::new("orphan", file::TYPE))
            .await
            .unwrap();

        let manager = BlobStoreManager::builder(configs).build();
        manager.start().await.unwrap();

        assert_eq!(manager.require("grp").unwrap().state(), StoreState::Started);
        assert_eq!(manager.require("a").unwrap().state(), StoreState::Started);
        assert_eq!(manager.require("orphan").unwrap().state(), StoreState::Failed);

        manager.stop().await;
        assert_eq!(manager.require("a").unwrap().state(), StoreState::Stopped);
    }
}
