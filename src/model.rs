//! Class entity and its request/response shapes.

use serde::{Deserialize, Serialize};

/// Persisted class. `id` is `None` until the repository assigns one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRecord {
    pub id: Option<i64>,
    pub name: String,
}

impl ClassRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
        }
    }
}

/// Write-facing shape of a class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassRequest {
    pub name: String,
}

impl ClassRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// Read-facing shape of a class. Also the cached value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassResponse {
    pub id: i64,
    pub name: String,
}

impl ClassResponse {
    /// Convert a stored record. Returns `None` for a record that was never
    /// saved.
    pub fn from_record(record: &ClassRecord) -> Option<Self> {
        record.id.map(|id| Self {
            id,
            name: record.name.clone(),
        })
    }
}
