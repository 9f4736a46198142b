use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{normalize_name, BlobStoreConfiguration, ConfigurationStore};
use crate::error::{BlobStoreError, Result};

/// Process-local configuration store, for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryConfigurationStore {
    entries: Mutex<BTreeMap<String, BlobStoreConfiguration>>,
}

impl MemoryConfigurationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[async_trait]
impl ConfigurationStore for MemoryConfigurationStore {
    async fn list(&self) -> Result<Vec<BlobStoreConfiguration>> {
        Ok(self.entries.lock().values().cloned().collect())
    }

    async fn read(&self, name: &str) -> Result<Option<BlobStoreConfiguration>> {
        Ok(self.entries.lock().get(&normalize_name(name)).cloned())
    }

    async fn create(&self, config: &BlobStoreConfiguration) -> Result<()> {
        let mut entries = self.entries.lock();
        let key = config.key();
        if entries.contains_key(&key) {
            return Err(BlobStoreError::DuplicateStore(config.name.clone()));
        }
        entries.insert(key, config.clone());
        Ok(())
    }

    async fn update(&self, config: &BlobStoreConfiguration) -> Result<()> {
        let mut entries = self.entries.lock();
        match entries.get_mut(&config.key()) {
            Some(existing) => {
                *existing = config.clone();
                Ok(())
            }
            None => Err(BlobStoreError::NotFound(config.name.clone())),
        }
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(&normalize_name(name)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_names_rejected_case_insensitively() {
        let store = MemoryConfigurationStore::new();
        store
            .create(&BlobStoreConfiguration::new("Foo", "file"))
            .await
            .unwrap();

        let err = store
            .create(&BlobStoreConfiguration::new("FOO", "file"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::DuplicateStore(_)));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let store = MemoryConfigurationStore::new();
        let config = BlobStoreConfiguration::new("a", "file");
        assert!(store.update(&config).await.is_err());

        store.create(&config).await.unwrap();
        let updated = config.clone().with_attribute("file", "path", "/tmp/a");
        store.update(&updated).await.unwrap();
        assert_eq!(store.read("A").await.unwrap(), Some(updated));

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert!(store.is_empty());
    }
}
