//! Persistence ports: metadata cache storage and saved inputs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{CachedServerList, CollectionId, CollectionScope, ServerMetadataEntry};

/// Storage failures. `NotFound` is an expected steady state on first run
/// and must not be logged as an error by callers.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("no persisted state")]
    NotFound,

    #[error("storage I/O error: {0}")]
    Io(String),

    #[error("persisted state is corrupt: {0}")]
    Corrupt(String),
}

/// Serialized form of the metadata cache.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedMetadata {
    /// Per-definition capability snapshots, most-recently-used last.
    #[serde(default)]
    pub entries: Vec<(String, ServerMetadataEntry)>,

    /// Per-collection cached definition lists for lazy collections.
    #[serde(default)]
    pub collections: Vec<(CollectionId, CachedServerList)>,
}

/// Generic persisted storage for the metadata cache.
#[async_trait]
pub trait MetadataStorage: Send + Sync {
    async fn load(&self) -> Result<PersistedMetadata, StorageError>;
    async fn store(&self, state: &PersistedMetadata) -> Result<(), StorageError>;
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    state: Mutex<Option<PersistedMetadata>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStorage for MemoryStorage {
    async fn load(&self) -> Result<PersistedMetadata, StorageError> {
        self.state
            .lock()
            .map_err(|_| StorageError::Io("poisoned".to_string()))?
            .clone()
            .ok_or(StorageError::NotFound)
    }

    async fn store(&self, state: &PersistedMetadata) -> Result<(), StorageError> {
        *self
            .state
            .lock()
            .map_err(|_| StorageError::Io("poisoned".to_string()))? = Some(state.clone());
        Ok(())
    }
}

/// Persisted user-supplied variables and secrets, keyed by input id and
/// scope.
#[async_trait]
pub trait SavedInputStore: Send + Sync {
    async fn set(&self, key: &str, scope: CollectionScope, value: String);
    async fn get(&self, key: &str, scope: CollectionScope) -> Option<String>;
}

/// In-memory saved inputs for tests.
#[derive(Default)]
pub struct MemorySavedInputs {
    values: Mutex<HashMap<(String, CollectionScope), String>>,
}

impl MemorySavedInputs {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SavedInputStore for MemorySavedInputs {
    async fn set(&self, key: &str, scope: CollectionScope, value: String) {
        if let Ok(mut values) = self.values.lock() {
            values.insert((key.to_string(), scope), value);
        }
    }

    async fn get(&self, key: &str, scope: CollectionScope) -> Option<String> {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(&(key.to_string(), scope)).cloned())
    }
}
