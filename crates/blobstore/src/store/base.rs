//! State shared by every backend: configuration, lifecycle, freeze flag and
//! space accounting.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::{StoreMetrics, StoreState};
use crate::configuration::BlobStoreConfiguration;
use crate::error::{BlobStoreError, Result};

#[derive(Debug)]
pub struct StoreCore {
    config: RwLock<BlobStoreConfiguration>,
    state: Mutex<StoreState>,
    frozen: AtomicBool,
    blob_count: AtomicU64,
    total_size: AtomicU64,
}

impl StoreCore {
    pub fn new(config: BlobStoreConfiguration) -> Self {
        Self {
            config: RwLock::new(config),
            state: Mutex::new(StoreState::New),
            frozen: AtomicBool::new(false),
            blob_count: AtomicU64::new(0),
            total_size: AtomicU64::new(0),
        }
    }

    pub fn configuration(&self) -> BlobStoreConfiguration {
        self.config.read().clone()
    }

    pub fn name(&self) -> String {
        self.config.read().name.clone()
    }

    pub fn replace_configuration(&self, config: BlobStoreConfiguration) -> Result<()> {
        let state = self.state();
        if state == StoreState::Started {
            return Err(BlobStoreError::configuration(format!(
                "blob store '{}' must be stopped before it is reconfigured",
                config.name
            )));
        }
        *self.config.write() = config;
        Ok(())
    }

    pub fn state(&self) -> StoreState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: StoreState) {
        *self.state.lock() = state;
    }

    /// The freeze flag survives stop/start cycles.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }

    pub fn unfreeze(&self) {
        self.frozen.store(false, Ordering::SeqCst);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    pub fn ensure_started(&self) -> Result<()> {
        match self.state() {
            StoreState::Started => Ok(()),
            state => Err(BlobStoreError::NotStarted {
                name: self.name(),
                state: state.to_string(),
            }),
        }
    }

    pub fn ensure_writable(&self) -> Result<()> {
        self.ensure_started()?;
        if self.is_frozen() {
            return Err(BlobStoreError::Frozen(self.name()));
        }
        Ok(())
    }

    pub fn metrics(&self) -> StoreMetrics {
        StoreMetrics {
            blob_count: self.blob_count.load(Ordering::Relaxed),
            total_size: self.total_size.load(Ordering::Relaxed),
        }
    }

    pub fn reset_metrics(&self, metrics: StoreMetrics) {
        self.blob_count.store(metrics.blob_count, Ordering::Relaxed);
        self.total_size.store(metrics.total_size, Ordering::Relaxed);
    }

    pub fn record_created(&self, size: u64) {
        self.blob_count.fetch_add(1, Ordering::Relaxed);
        self.total_size.fetch_add(size, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, size: u64) {
        let _ = self
            .blob_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(1))
            });
        let _ = self
            .total_size
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                Some(n.saturating_sub(size))
            });
    }
}
