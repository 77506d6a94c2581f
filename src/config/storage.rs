//! Cache and persistence configuration types.

use serde::Deserialize;

/// Cache type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    Memory,
    Redis,
}

/// Cache configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache type discriminator.
    #[serde(rename = "type")]
    pub cache_type: CacheType,
    /// Redis connection URL.
    pub url: String,
    /// Key namespace of the notifying service.
    pub namespace: String,
    /// Key namespace of the service variant that does not publish.
    pub simple_namespace: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_type: CacheType::Memory,
            url: "redis://localhost:6379".to_string(),
            namespace: "class".to_string(),
            simple_namespace: "simple-class".to_string(),
        }
    }
}

/// Storage type discriminator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Memory,
    Sqlite,
}

/// Persistence configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage type discriminator.
    #[serde(rename = "type")]
    pub storage_type: StorageType,
    /// SQLite database file.
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageType::Memory,
            path: "data/classbus.db".to_string(),
        }
    }
}
