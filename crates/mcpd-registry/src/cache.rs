//! Metadata cache: last-known capability snapshots per server and cached
//! definition lists per lazy collection.
//!
//! Mutations only mark the cache dirty; persistence happens on an
//! externally-driven flush signal (host "about to persist state") and
//! only when something changed since the last flush.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use mcpd_core::domain::{CachedServerList, CollectionId, ServerMetadataEntry};
use mcpd_core::ports::{MetadataStorage, PersistedMetadata, StorageError};

/// Bounded capacity of the per-definition snapshot map.
const ENTRY_CAPACITY: usize = 128;

#[derive(Debug, Default)]
struct CacheInner {
    /// Per-definition snapshots with LRU ordering (front = oldest).
    entries: HashMap<String, ServerMetadataEntry>,
    order: VecDeque<String>,
    /// Per-collection cached definition lists for lazy collections.
    collections: HashMap<CollectionId, CachedServerList>,
    dirty: bool,
}

impl CacheInner {
    fn touch(&mut self, definition_id: &str) {
        self.order.retain(|id| id != definition_id);
        self.order.push_back(definition_id.to_string());
    }

    fn evict_over_capacity(&mut self) {
        while self.entries.len() > ENTRY_CAPACITY {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }
}

/// Persisted key/value store of capability metadata.
pub struct McpMetadataCache {
    inner: Mutex<CacheInner>,
    storage: Arc<dyn MetadataStorage>,
}

impl McpMetadataCache {
    /// Create an empty cache backed by `storage`.
    pub fn new(storage: Arc<dyn MetadataStorage>) -> Self {
        Self {
            inner: Mutex::new(CacheInner::default()),
            storage,
        }
    }

    /// Create a cache and hydrate it from storage. A missing persisted
    /// state is an expected first-run condition and is not logged.
    pub async fn load(storage: Arc<dyn MetadataStorage>) -> Self {
        let cache = Self::new(storage);
        match cache.storage.load().await {
            Ok(state) => cache.hydrate(state),
            Err(StorageError::NotFound) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load MCP metadata cache");
            }
        }
        cache
    }

    fn hydrate(&self, state: PersistedMetadata) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        for (id, entry) in state.entries {
            inner.order.push_back(id.clone());
            inner.entries.insert(id, entry);
        }
        for (id, list) in state.collections {
            inner.collections.insert(id, list);
        }
        inner.evict_over_capacity();
        inner.dirty = false;
    }

    /// Snapshot for one server definition, if cached.
    pub fn get(&self, definition_id: &str) -> Option<ServerMetadataEntry> {
        let mut inner = self.inner.lock().ok()?;
        let entry = inner.entries.get(definition_id).cloned()?;
        inner.touch(definition_id);
        Some(entry)
    }

    /// Store a snapshot for one server definition.
    pub fn store(&self, definition_id: &str, entry: ServerMetadataEntry) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.entries.insert(definition_id.to_string(), entry);
        inner.touch(definition_id);
        inner.evict_over_capacity();
        inner.dirty = true;
    }

    /// Cached definition list for a lazy collection.
    pub fn servers_for(&self, collection_id: &CollectionId) -> Option<CachedServerList> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.collections.get(collection_id).cloned())
    }

    /// Store the definition list of a lazy collection.
    pub fn store_servers(&self, collection_id: &CollectionId, list: CachedServerList) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        let unchanged = inner.collections.get(collection_id) == Some(&list);
        if !unchanged {
            inner.collections.insert(collection_id.clone(), list);
            inner.dirty = true;
        }
    }

    /// Drop both maps and mark dirty so the next flush persists the
    /// empty state.
    pub fn reset(&self) {
        let Ok(mut inner) = self.inner.lock() else {
            return;
        };
        inner.entries.clear();
        inner.order.clear();
        inner.collections.clear();
        inner.dirty = true;
    }

    /// Persist if anything changed since the last flush.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let state = {
            let Ok(mut inner) = self.inner.lock() else {
                return Err(StorageError::Io("poisoned".to_string()));
            };
            if !inner.dirty {
                return Ok(());
            }
            inner.dirty = false;
            PersistedMetadata {
                entries: inner
                    .order
                    .iter()
                    .filter_map(|id| {
                        inner.entries.get(id).map(|entry| (id.clone(), entry.clone()))
                    })
                    .collect(),
                collections: inner
                    .collections
                    .iter()
                    .map(|(id, list)| (id.clone(), list.clone()))
                    .collect(),
            }
        };

        self.storage.store(&state).await
    }
}
