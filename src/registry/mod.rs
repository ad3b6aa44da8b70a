//! Durable store of domain records
//!
//! The registry is the single source of truth for declared intent. Two
//! backends are provided:
//! - `JsonFileRegistry`: one JSON array, rewritten atomically on each mutation
//! - `SqliteRegistry`: per-key transactional storage

mod file;
mod sqlite;

pub use file::JsonFileRegistry;
pub use sqlite::SqliteRegistry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Persisted declaration of one hostname's proxy target and flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainRecord {
    #[serde(alias = "domain")]
    pub name: String,
    pub subfolder: String,
    #[serde(alias = "ssl", default)]
    pub ssl_enabled: bool,
    #[serde(alias = "enabled", default)]
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DomainRecord {
    /// A fresh record with both timestamps set to now
    pub fn new(name: impl Into<String>, subfolder: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            subfolder: subfolder.into(),
            ssl_enabled: false,
            active: false,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("registry file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("registry database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Storage contract for domain records
///
/// `upsert` replaces the whole record for its name, keeps the stored
/// `created_at` if one exists and always stamps `updated_at` with the
/// current time. Implementations serialize their own mutations.
pub trait Registry: Send + Sync {
    fn list_all(&self) -> Result<Vec<DomainRecord>, RegistryError>;

    fn get(&self, name: &str) -> Result<Option<DomainRecord>, RegistryError>;

    /// Returns the record as stored
    fn upsert(&self, record: DomainRecord) -> Result<DomainRecord, RegistryError>;

    /// Returns false when no record had that name
    fn remove(&self, name: &str) -> Result<bool, RegistryError>;
}
