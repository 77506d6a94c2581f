//! Class command service.
//!
//! Every mutation runs `persist -> cache -> notify`. A failure in the
//! persistence or cache step publishes a FAILED event and returns the
//! original error. Notifications are only submitted here; their broker
//! confirmations settle in the background and never fail or delay the call.
//!
//! Reads are cache-aside: a hit skips persistence, a miss loads the record
//! and fills the cache.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache::{cache_key, Cache, CacheError, CacheExt};
use crate::event::Action;
use crate::model::{ClassRecord, ClassRequest, ClassResponse};
use crate::publisher::Notifier;
use crate::storage::{ClassRepository, StorageError};

/// Cache namespace of the notifying service.
pub const DEFAULT_NAMESPACE: &str = "class";
/// Cache namespace of the service without notifications.
pub const DEFAULT_SIMPLE_NAMESPACE: &str = "simple-class";

/// Errors returned by the class service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Class not found with id: {id}")]
    NotFound { id: i64 },

    #[error("Storage error: {0}")]
    Storage(StorageError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl From<StorageError> for ServiceError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(id) => ServiceError::NotFound { id },
            other => ServiceError::Storage(other),
        }
    }
}

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Orchestrates persistence, cache and notifications for classes.
pub struct ClassService {
    repository: Arc<dyn ClassRepository>,
    cache: Arc<dyn Cache>,
    notifier: Option<Arc<dyn Notifier>>,
    namespace: String,
}

impl ClassService {
    /// Service that publishes a notification for every mutation.
    pub fn new(
        repository: Arc<dyn ClassRepository>,
        cache: Arc<dyn Cache>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            repository,
            cache,
            notifier: Some(notifier),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    /// Service that never publishes, caching under its own namespace.
    pub fn without_notifications(repository: Arc<dyn ClassRepository>, cache: Arc<dyn Cache>) -> Self {
        Self {
            repository,
            cache,
            notifier: None,
            namespace: DEFAULT_SIMPLE_NAMESPACE.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, id: i64) -> String {
        cache_key(&self.namespace, id)
    }

    pub async fn create(&self, request: ClassRequest) -> Result<ClassResponse> {
        info!(name = %request.name, "Creating class");
        match self.try_create(&request).await {
            Ok(response) => {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_created(response.id, &response.name).await;
                }
                Ok(response)
            }
            Err(e) => {
                warn!(name = %request.name, error = %e, "Failed to create class");
                self.notify_failed(None, Some(&request.name), Action::Create, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn try_create(&self, request: &ClassRequest) -> Result<ClassResponse> {
        let saved = self
            .repository
            .save(ClassRecord::new(request.name.clone()))
            .await?;
        let response = to_response(&saved)?;
        self.cache.set_json(&self.key(response.id), &response).await?;
        Ok(response)
    }

    /// Cache-aside read.
    pub async fn get_by_id(&self, id: i64) -> Result<ClassResponse> {
        let key = self.key(id);
        match self.cache.get_json::<ClassResponse>(&key).await {
            Ok(Some(cached)) => {
                debug!(id, "Cache hit");
                return Ok(cached);
            }
            Ok(None) => debug!(id, "Cache miss"),
            Err(e) => warn!(id, error = %e, "Cache read failed, treating as miss"),
        }

        let record = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound { id })?;
        let response = to_response(&record)?;

        if let Err(e) = self.cache.set_json(&key, &response).await {
            warn!(id, error = %e, "Failed to fill cache");
        }
        Ok(response)
    }

    pub async fn update(&self, id: i64, request: ClassRequest) -> Result<ClassResponse> {
        info!(id, "Updating class");
        match self.try_update(id, &request).await {
            Ok(response) => {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_updated(response.id, &response.name).await;
                }
                Ok(response)
            }
            Err(e) => {
                warn!(id, error = %e, "Failed to update class");
                self.notify_failed(Some(id), Some(&request.name), Action::Update, &e)
                    .await;
                Err(e)
            }
        }
    }

    async fn try_update(&self, id: i64, request: &ClassRequest) -> Result<ClassResponse> {
        let mut record = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound { id })?;
        record.name = request.name.clone();

        let saved = self.repository.save(record).await?;
        let response = to_response(&saved)?;
        self.cache.set_json(&self.key(id), &response).await?;
        Ok(response)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        info!(id, "Deleting class");
        match self.try_delete(id).await {
            Ok(name) => {
                if let Some(notifier) = &self.notifier {
                    notifier.notify_deleted(id, &name).await;
                }
                Ok(())
            }
            Err(e) => {
                warn!(id, error = %e, "Failed to delete class");
                self.notify_failed(Some(id), None, Action::Delete, &e).await;
                Err(e)
            }
        }
    }

    async fn try_delete(&self, id: i64) -> Result<String> {
        let record = self
            .repository
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound { id })?;

        self.repository.delete_by_id(id).await?;
        self.cache.delete(&self.key(id)).await?;
        Ok(record.name)
    }

    /// Every class, read straight from persistence.
    pub async fn list(&self) -> Result<Vec<ClassResponse>> {
        let records = self.repository.find_all().await?;
        records.iter().map(to_response).collect()
    }

    async fn notify_failed(&self, id: Option<i64>, name: Option<&str>, action: Action, error: &ServiceError) {
        if let Some(notifier) = &self.notifier {
            notifier
                .notify_operation_failed(id, name, action, &error.to_string())
                .await;
        }
    }
}

fn to_response(record: &ClassRecord) -> Result<ClassResponse> {
    ClassResponse::from_record(record).ok_or_else(|| {
        ServiceError::Storage(StorageError::Database(
            "repository returned a class without an id".to_string(),
        ))
    })
}
