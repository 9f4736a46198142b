//! SQLite-backed configuration store.
//!
//! Manages its own connection pool. Names are unique case-insensitively
//! through a `COLLATE NOCASE` primary key; attributes are stored as JSON.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::info;

use super::{Attributes, BlobStoreConfiguration, ConfigurationStore};
use crate::error::{BlobStoreError, Result};

#[derive(Debug, Clone)]
pub struct SqliteConfigurationStore {
    pool: SqlitePool,
}

impl SqliteConfigurationStore {
    /// Open (creating if missing) a file-based database and run migrations.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;

        info!(path = %path.display(), "blob store configuration database initialized");
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .create_if_missing(true);

        // A single connection, otherwise each connection sees its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS blob_store_configurations (
                name TEXT PRIMARY KEY COLLATE NOCASE,
                type TEXT NOT NULL,
                attributes TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<BlobStoreConfiguration> {
        let attributes: String = row.get("attributes");
        Ok(BlobStoreConfiguration {
            name: row.get("name"),
            type_name: row.get("type"),
            attributes: serde_json::from_str::<Attributes>(&attributes)?,
        })
    }
}

#[async_trait]
impl ConfigurationStore for SqliteConfigurationStore {
    async fn list(&self) -> Result<Vec<BlobStoreConfiguration>> {
        let rows = sqlx::query("SELECT name, type, attributes FROM blob_store_configurations ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::from_row).collect()
    }

    async fn read(&self, name: &str) -> Result<Option<BlobStoreConfiguration>> {
        let row = sqlx::query("SELECT name, type, attributes FROM blob_store_configurations WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::from_row).transpose()
    }

    async fn create(&self, config: &BlobStoreConfiguration) -> Result<()> {
        let now = Utc::now().timestamp();
        let attributes = serde_json::to_string(&config.attributes)?;
        let result = sqlx::query(
            r#"
            INSERT INTO blob_store_configurations (name, type, attributes, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            "#,
        )
        .bind(&config.name)
        .bind(&config.type_name)
        .bind(attributes)
        .bind(now)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(BlobStoreError::DuplicateStore(config.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn update(&self, config: &BlobStoreConfiguration) -> Result<()> {
        let attributes = serde_json::to_string(&config.attributes)?;
        let result = sqlx::query(
            r#"
            UPDATE blob_store_configurations
            SET type = ?2, attributes = ?3, updated_at = ?4
            WHERE name = ?1
            "#,
        )
        .bind(&config.name)
        .bind(&config.type_name)
        .bind(attributes)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(BlobStoreError::NotFound(config.name.clone()));
        }
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM blob_store_configurations WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_crud_round_trip() {
        let store = SqliteConfigurationStore::in_memory().await.unwrap();
        let config = BlobStoreConfiguration::new("Releases", "group")
            .with_attribute("group", "members", json!(["a", "b"]));

        store.create(&config).await.unwrap();
        assert_eq!(store.read("releases").await.unwrap(), Some(config.clone()));

        let updated = config.clone().with_attribute("group", "fillPolicy", "writeToFirst");
        store.update(&updated).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec![updated]);

        assert!(store.delete("RELEASES").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let store = SqliteConfigurationStore::in_memory().await.unwrap();
        store
            .create(&BlobStoreConfiguration::new("Foo", "file"))
            .await
            .unwrap();

        let err = store
            .create(&BlobStoreConfiguration::new("foo", "file"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::DuplicateStore(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_store() {
        let store = SqliteConfigurationStore::in_memory().await.unwrap();
        let err = store
            .update(&BlobStoreConfiguration::new("missing", "file"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobStoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_file_database_persists() {
        let temp_dir = tempfile::tempdir().unwrap();
        let db_path = temp_dir.path().join("nested").join("config.db");

        {
            let store = SqliteConfigurationStore::new(&db_path).await.unwrap();
            store
                .create(&BlobStoreConfiguration::new("default", "file"))
                .await
                .unwrap();
            store.close().await;
        }

        let store = SqliteConfigurationStore::new(&db_path).await.unwrap();
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
