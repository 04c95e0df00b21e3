//! Extension-contributed collections.
//!
//! Contributions arrive through the host's extension system. Each one
//! registers as a lazy collection: the cached definition list (if any)
//! shows immediately, and the real list resolves when the collection is
//! first needed, which activates the contributing extension.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mcpd_core::domain::{CachedServerList, CollectionId, McpCollection, McpServerDefinition};
use mcpd_core::ports::{CollectionLoader, ExtensionHost};

use crate::cache::McpMetadataCache;
use crate::registry::{McpCollectionRegistry, RegistrationHandle};

/// One extension's contributed server collection.
pub struct ExtensionContribution {
    pub extension_id: String,
    pub label: String,
    /// Resolves the real definition list once the extension is active.
    pub loader: Arc<dyn CollectionLoader>,
}

/// Loader wrapper: activates the extension first, then snapshots the
/// resolved list into the metadata cache for the next cold start.
struct ActivatingLoader {
    host: Arc<dyn ExtensionHost>,
    cache: Arc<McpMetadataCache>,
    collection_id: CollectionId,
    extension_label: String,
    inner: Arc<dyn CollectionLoader>,
}

#[async_trait]
impl CollectionLoader for ActivatingLoader {
    async fn load(&self) -> Result<Vec<McpServerDefinition>, String> {
        let event = format!("onMcpCollection:{}", self.collection_id);
        self.host.activate(&event).await?;

        let definitions = self.inner.load().await?;
        self.cache.store_servers(
            &self.collection_id,
            CachedServerList {
                servers: definitions.clone(),
                extension_label: Some(self.extension_label.clone()),
            },
        );
        Ok(definitions)
    }

    async fn removed(&self) {
        self.inner.removed().await;
    }
}

/// Tracks extension contributions and their registrations.
pub struct ExtensionDiscovery {
    registry: Arc<McpCollectionRegistry>,
    cache: Arc<McpMetadataCache>,
    host: Arc<dyn ExtensionHost>,
    handles: Mutex<HashMap<String, RegistrationHandle>>,
}

impl ExtensionDiscovery {
    pub fn new(
        registry: Arc<McpCollectionRegistry>,
        cache: Arc<McpMetadataCache>,
        host: Arc<dyn ExtensionHost>,
    ) -> Self {
        Self {
            registry,
            cache,
            host,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Register a contribution as a lazy collection. A cached list from a
    /// previous session is published immediately.
    pub fn contribution_added(&self, contribution: ExtensionContribution) {
        let collection_id = CollectionId::for_extension(&contribution.extension_id);
        let cached = self.cache.servers_for(&collection_id);
        let is_cached = cached.is_some();
        let servers = cached.map(|list| list.servers).unwrap_or_default();

        let collection = McpCollection::new(
            collection_id.clone(),
            contribution.label.clone(),
            servers,
        )
        .with_lazy(is_cached);

        let loader = Arc::new(ActivatingLoader {
            host: Arc::clone(&self.host),
            cache: Arc::clone(&self.cache),
            collection_id,
            extension_label: contribution.label,
            inner: contribution.loader,
        });

        let handle = self.registry.register_collection(collection, Some(loader));
        if let Ok(mut handles) = self.handles.lock() {
            handles.insert(contribution.extension_id, handle);
        }
    }

    /// Drop a contribution; its collection deregisters and the loader is
    /// told it went away.
    pub fn contribution_removed(&self, extension_id: &str) {
        let handle = self
            .handles
            .lock()
            .ok()
            .and_then(|mut handles| handles.remove(extension_id));
        drop(handle);
    }
}
