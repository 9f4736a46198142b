//! The engine as the daemon runs it: a SQLite configuration store and a
//! started [`BlobStoreManager`].

use std::sync::Arc;

use blobstore::{
    BlobStoreError, BlobStoreManager, CompactionCoordinator, NoMoves, SqliteConfigurationStore,
};

use crate::config::DaemonConfig;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("failed to create data directory: {0}")]
    DataDir(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] BlobStoreError),
}

#[derive(Debug)]
pub struct DaemonState {
    pub config: DaemonConfig,
    pub manager: BlobStoreManager,
    configs: Arc<SqliteConfigurationStore>,
}

impl DaemonState {
    /// Open the configuration database and start every persisted store.
    pub async fn open(config: DaemonConfig) -> Result<Self, StateError> {
        std::fs::create_dir_all(&config.data_dir)?;
        let database = config.database_path();
        let configs = Arc::new(SqliteConfigurationStore::new(&database).await?);
        let manager = BlobStoreManager::builder(configs.clone()).build();
        manager.start().await?;
        tracing::info!(
            data_dir = %config.data_dir.display(),
            database = %database.display(),
            stores = manager.browse().len(),
            "depot state opened"
        );

        Ok(Self {
            config,
            manager,
            configs,
        })
    }

    /// A coordinator sized by the compaction section of the config.
    pub fn coordinator(&self) -> CompactionCoordinator {
        CompactionCoordinator::new(
            self.manager.clone(),
            Arc::new(NoMoves),
            self.config.compaction.settings(),
        )
    }

    pub async fn close(self) {
        self.manager.stop().await;
        self.configs.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobstore::{file, BlobStoreConfiguration, StoreState};

    fn config_in(dir: &std::path::Path) -> DaemonConfig {
        DaemonConfig {
            data_dir: dir.join("data"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stores_survive_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = config_in(temp_dir.path());

        let state = DaemonState::open(config.clone()).await.unwrap();
        state
            .manager
            .create(BlobStoreConfiguration::new("main", file::TYPE).with_attribute(
                file::SECTION,
                file::PATH,
                config.store_path("main").to_string_lossy().to_string(),
            ))
            .await
            .unwrap();
        state.close().await;

        let reopened = DaemonState::open(config).await.unwrap();
        let store = reopened.manager.require("MAIN").unwrap();
        assert_eq!(store.state(), StoreState::Started);
        assert!(temp_dir.path().join("data").join("stores.db").exists());
        reopened.close().await;
    }
}
