//! Class persistence port.
//!
//! Implementations:
//! - `InMemoryClassRepository`: process-local map, sequential ids
//! - `SqliteClassRepository`: SQLite via sqlx + sea-query (feature `sqlite`)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::{StorageConfig, StorageType};
use crate::model::ClassRecord;

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod schema;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryClassRepository;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteClassRepository;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Class not found: id={0}")]
    NotFound(i64),

    #[error("Database error: {0}")]
    Database(String),
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

/// Interface to class persistence.
#[async_trait]
pub trait ClassRepository: Send + Sync {
    /// Insert a record without an id, or overwrite the record with its id.
    /// Returns the record with its id assigned.
    async fn save(&self, record: ClassRecord) -> Result<ClassRecord>;

    async fn find_by_id(&self, id: i64) -> Result<Option<ClassRecord>>;

    /// Remove a record. Fails with `NotFound` if it does not exist.
    async fn delete_by_id(&self, id: i64) -> Result<()>;

    /// All records, ordered by id.
    async fn find_all(&self) -> Result<Vec<ClassRecord>>;
}

/// Initialize storage based on configuration.
pub async fn init_storage(
    config: &StorageConfig,
) -> std::result::Result<Arc<dyn ClassRepository>, Box<dyn std::error::Error + Send + Sync>> {
    match config.storage_type {
        StorageType::Memory => {
            info!(storage_type = "memory", "Storage initialized");
            Ok(Arc::new(InMemoryClassRepository::new()))
        }
        StorageType::Sqlite => {
            #[cfg(feature = "sqlite")]
            {
                if let Some(parent) = std::path::Path::new(&config.path).parent() {
                    std::fs::create_dir_all(parent)?;
                }

                let pool =
                    sqlx::SqlitePool::connect(&format!("sqlite:{}?mode=rwc", config.path)).await?;

                let repository = SqliteClassRepository::new(pool);
                repository.init().await?;

                info!(storage_type = "sqlite", path = %config.path, "Storage initialized");
                Ok(Arc::new(repository))
            }

            #[cfg(not(feature = "sqlite"))]
            {
                Err("SQLite support requires the 'sqlite' feature. Rebuild with --features sqlite".into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_memory_storage() {
        let repository = init_storage(&StorageConfig::default()).await.unwrap();
        assert!(repository.find_all().await.unwrap().is_empty());
    }

    #[cfg(feature = "sqlite")]
    #[tokio::test]
    async fn test_init_sqlite_storage_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("classes.db");
        let config = StorageConfig {
            storage_type: StorageType::Sqlite,
            path: path.to_string_lossy().into_owned(),
        };

        let repository = init_storage(&config).await.unwrap();
        let saved = repository.save(ClassRecord::new("Math")).await.unwrap();

        assert!(path.exists());
        assert_eq!(
            repository.find_by_id(saved.id.unwrap()).await.unwrap(),
            Some(saved)
        );
    }
}
