//! Key-value cache port.
//!
//! Values are strings; `CacheExt` layers JSON on top. Keys are always built
//! with `cache_key` as `{namespace}:{id}`.
//!
//! Implementations:
//! - `InMemoryCache`: process-local map with per-key expiry
//! - `RedisCache`: Redis via a connection manager (feature `redis`)

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::info;

use crate::config::{CacheConfig, CacheType};

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::InMemoryCache;
#[cfg(feature = "redis")]
pub use self::redis::RedisCache;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur during cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Cache backend error: {0}")]
    Backend(String),

    #[error("Cache serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(feature = "redis")]
impl From<::redis::RedisError> for CacheError {
    fn from(err: ::redis::RedisError) -> Self {
        CacheError::Backend(err.to_string())
    }
}

/// Build the cache key of an entity in a namespace.
pub fn cache_key(namespace: &str, id: impl Display) -> String {
    format!("{}:{}", namespace, id)
}

/// Interface to the cache backend.
#[async_trait]
pub trait Cache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remove a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Set the expiry of an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Remove every key matching a glob pattern (`*` wildcard). Returns the
    /// number of keys removed.
    async fn delete_pattern(&self, pattern: &str) -> Result<u64>;
}

/// JSON helpers over any `Cache`.
#[async_trait]
pub trait CacheExt: Cache {
    async fn get_json<T: DeserializeOwned + Send>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

/// Initialize the cache based on configuration.
///
/// Requires the corresponding feature for external caches:
/// - Redis: `--features redis`
pub async fn init_cache(
    config: &CacheConfig,
) -> std::result::Result<Arc<dyn Cache>, Box<dyn std::error::Error + Send + Sync>> {
    match config.cache_type {
        CacheType::Memory => {
            info!(cache_type = "memory", "Cache initialized");
            Ok(Arc::new(InMemoryCache::new()))
        }
        CacheType::Redis => {
            #[cfg(feature = "redis")]
            {
                let cache = RedisCache::connect(&config.url).await?;
                info!(cache_type = "redis", "Cache initialized");
                Ok(Arc::new(cache))
            }

            #[cfg(not(feature = "redis"))]
            {
                Err("Redis support requires the 'redis' feature. Rebuild with --features redis".into())
            }
        }
    }
}

/// Glob match supporting `*` only, as used by `delete_pattern`.
pub(crate) fn glob_match(pattern: &str, key: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == key;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !key.starts_with(first) || key.len() < first.len() + last.len() || !key.ends_with(last) {
        return false;
    }

    let mut rest = &key[first.len()..key.len() - last.len()];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(pos) => rest = &rest[pos + middle.len()..],
            None => return false,
        }
    }
    true
}
