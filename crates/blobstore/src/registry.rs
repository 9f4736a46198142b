//! Live store instances keyed by lower-cased name.
//!
//! Reads take a shared lock only. Decisions that depend on what is registered
//! (duplicate detection, freeze) are serialized by the manager on top of this.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;

use crate::configuration::normalize_name;
use crate::store::BlobStore;

type Stores = HashMap<String, Arc<dyn BlobStore>>;

#[derive(Debug, Clone, Default)]
pub struct Registry {
    stores: Arc<RwLock<Stores>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn BlobStore>> {
        self.stores.read().get(&normalize_name(name)).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.stores.read().contains_key(&normalize_name(name))
    }

    /// Snapshot of every registered store, sorted by name.
    pub fn list(&self) -> Vec<Arc<dyn BlobStore>> {
        snapshot(&self.stores.read())
    }

    /// Publish `store` unless the name is taken. On a clash the existing
    /// instance is left in place and `store` is handed back.
    pub fn insert_if_absent(
        &self,
        store: Arc<dyn BlobStore>,
    ) -> Result<(), Arc<dyn BlobStore>> {
        let key = normalize_name(&store.name());
        let mut stores = self.stores.write();
        if stores.contains_key(&key) {
            return Err(store);
        }
        stores.insert(key, store);
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Option<Arc<dyn BlobStore>> {
        self.stores.write().remove(&normalize_name(name))
    }

    pub fn len(&self) -> usize {
        self.stores.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stores.read().is_empty()
    }

    /// Non-owning handle for composite stores that resolve members by name.
    pub fn downgrade(&self) -> RegistryRef {
        RegistryRef(Arc::downgrade(&self.stores))
    }
}

/// Weak view of a [`Registry`]. Resolves to nothing once the registry is
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct RegistryRef(Weak<RwLock<Stores>>);

impl RegistryRef {
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn BlobStore>> {
        self.0.upgrade()?.read().get(&normalize_name(name)).cloned()
    }

    pub fn list(&self) -> Vec<Arc<dyn BlobStore>> {
        match self.0.upgrade() {
            Some(stores) => snapshot(&stores.read()),
            None => Vec::new(),
        }
    }
}

fn snapshot(stores: &Stores) -> Vec<Arc<dyn BlobStore>> {
    let mut entries: Vec<_> = stores.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    entries.into_iter().map(|(_, store)| store.clone()).collect()
}
