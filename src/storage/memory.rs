//! In-memory class repository.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{ClassRepository, Result, StorageError};
use crate::model::ClassRecord;

#[derive(Debug, Default)]
struct State {
    records: BTreeMap<i64, ClassRecord>,
    last_id: i64,
}

/// In-memory repository. Ids start at 1 and are never reused.
#[derive(Debug, Default)]
pub struct InMemoryClassRepository {
    state: RwLock<State>,
}

impl InMemoryClassRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClassRepository for InMemoryClassRepository {
    async fn save(&self, mut record: ClassRecord) -> Result<ClassRecord> {
        let mut state = self.state.write().await;
        let id = match record.id {
            Some(id) => {
                state.last_id = state.last_id.max(id);
                id
            }
            None => {
                state.last_id += 1;
                state.last_id
            }
        };
        record.id = Some(id);
        state.records.insert(id, record.clone());
        debug!(id, "Saved class");
        Ok(record)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<ClassRecord>> {
        Ok(self.state.read().await.records.get(&id).cloned())
    }

    async fn delete_by_id(&self, id: i64) -> Result<()> {
        match self.state.write().await.records.remove(&id) {
            Some(_) => Ok(()),
            None => Err(StorageError::NotFound(id)),
        }
    }

    async fn find_all(&self) -> Result<Vec<ClassRecord>> {
        Ok(self.state.read().await.records.values().cloned().collect())
    }
}
