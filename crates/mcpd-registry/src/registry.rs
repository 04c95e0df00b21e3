//! In-process collection registry.
//!
//! Discovery adapters register collections here; servers resolve their
//! connections through it. The registry owns the trust decisions, the
//! transport delegate list, lazy-collection loaders, and persisted saved
//! inputs.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use mcpd_core::domain::{
    CollectionId, CollectionScope, McpCollection, McpServerDefinition, McpServerLaunch,
};
use mcpd_core::events::{RegistryEvent, RegistryEventEmitter};
use mcpd_core::observable::ObservableValue;
use mcpd_core::ports::{CollectionLoader, McpError, SavedInputStore, TrustPrompt};

use crate::connection::Connection;
use crate::devmode;

/// Selects which transport implementation handles a launch.
///
/// Delegates are consulted in registration order; the first accepting
/// factory wins.
pub trait TransportFactory: Send + Sync {
    fn name(&self) -> &str;
    fn can_start(&self, launch: &McpServerLaunch) -> bool;
}

/// Default delegate: every launch type is started in-process.
#[derive(Debug, Default)]
pub struct LocalTransportFactory;

impl TransportFactory for LocalTransportFactory {
    fn name(&self) -> &str {
        "local"
    }

    fn can_start(&self, _launch: &McpServerLaunch) -> bool {
        true
    }
}

/// Parameters for [`McpCollectionRegistry::resolve_connection`].
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    pub collection_id: CollectionId,
    pub definition_id: String,
    /// Skip the trust prompt and treat the collection as trusted.
    pub force_trust: bool,
    /// Rewrite the launch for debugger attachment when the definition
    /// carries a debug configuration.
    pub debug: bool,
}

struct RegistryInner {
    /// Collections keyed by id; the serial identifies the registration
    /// so a stale handle cannot deregister a replacement.
    collections: HashMap<CollectionId, (u64, Arc<McpCollection>)>,
    next_serial: u64,
    loaders: HashMap<CollectionId, Arc<dyn CollectionLoader>>,
    /// Lazy collections whose loader already resolved.
    loaded: HashSet<CollectionId>,
    delegates: Vec<Arc<dyn TransportFactory>>,
    /// `true` trusted, `false` declined; absent means undecided.
    trust: HashMap<CollectionId, bool>,
}

/// The registry implementation used by the service and by tests.
pub struct McpCollectionRegistry {
    inner: Mutex<RegistryInner>,
    /// Bumped whenever the collection set or any trust state changes.
    generation: ObservableValue<u64>,
    trust_prompt: Arc<dyn TrustPrompt>,
    saved_inputs: Arc<dyn SavedInputStore>,
    emitter: Arc<dyn RegistryEventEmitter>,
}

impl McpCollectionRegistry {
    pub fn new(
        trust_prompt: Arc<dyn TrustPrompt>,
        saved_inputs: Arc<dyn SavedInputStore>,
        emitter: Arc<dyn RegistryEventEmitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(RegistryInner {
                collections: HashMap::new(),
                next_serial: 0,
                loaders: HashMap::new(),
                loaded: HashSet::new(),
                delegates: vec![Arc::new(LocalTransportFactory)],
                trust: HashMap::new(),
            }),
            generation: ObservableValue::new(0),
            trust_prompt,
            saved_inputs,
            emitter,
        })
    }

    fn bump(&self) {
        self.generation.update(|g| {
            *g += 1;
            true
        });
    }

    /// Subscribe to collection-set and trust changes.
    pub fn subscribe(&self) -> tokio::sync::watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Register (or replace) a collection. The returned handle
    /// deregisters it on drop.
    pub fn register_collection(
        self: &Arc<Self>,
        collection: McpCollection,
        loader: Option<Arc<dyn CollectionLoader>>,
    ) -> RegistrationHandle {
        let id = collection.id.clone();
        let label = collection.label.clone();
        let serial = {
            let Ok(mut inner) = self.inner.lock() else {
                return RegistrationHandle {
                    registry: Weak::new(),
                    collection_id: id,
                    serial: 0,
                };
            };
            inner.next_serial += 1;
            let serial = inner.next_serial;
            inner
                .collections
                .insert(id.clone(), (serial, Arc::new(collection)));
            match loader {
                Some(loader) => {
                    inner.loaders.insert(id.clone(), loader);
                    inner.loaded.remove(&id);
                }
                None => {
                    inner.loaders.remove(&id);
                }
            }
            serial
        };
        tracing::debug!(collection = %id, "Registered MCP collection");
        self.emitter.emit(RegistryEvent::CollectionRegistered {
            collection_id: id.clone(),
            label,
        });
        self.bump();
        RegistrationHandle {
            registry: Arc::downgrade(self),
            collection_id: id,
            serial,
        }
    }

    fn deregister(&self, collection_id: &CollectionId, serial: u64) {
        let (removed, pending_loader) = {
            let Ok(mut inner) = self.inner.lock() else {
                return;
            };
            // A handle for a replaced registration is stale; the
            // replacement stays.
            if inner
                .collections
                .get(collection_id)
                .is_none_or(|(current, _)| *current != serial)
            {
                return;
            }
            let loader = inner.loaders.remove(collection_id);
            let was_loaded = inner.loaded.remove(collection_id);
            let removed = inner.collections.remove(collection_id).is_some();
            (removed, if was_loaded { None } else { loader })
        };
        // The contribution disappeared before its loader ran; tell it.
        if let Some(loader) = pending_loader {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move { loader.removed().await });
            }
        }
        if removed {
            tracing::debug!(collection = %collection_id, "Deregistered MCP collection");
            self.emitter.emit(RegistryEvent::CollectionRemoved {
                collection_id: collection_id.clone(),
            });
            self.bump();
        }
    }

    /// Add a transport delegate. Delegates registered later are consulted
    /// after the built-in local factory.
    pub fn register_delegate(&self, delegate: Arc<dyn TransportFactory>) {
        if let Ok(mut inner) = self.inner.lock() {
            // Custom delegates take precedence over the catch-all local
            // factory.
            let local = inner.delegates.pop();
            inner.delegates.push(delegate);
            if let Some(local) = local {
                inner.delegates.push(local);
            }
        }
        self.bump();
    }

    /// Snapshot of the transport delegates in consultation order.
    pub fn delegates(&self) -> Vec<Arc<dyn TransportFactory>> {
        self.inner
            .lock()
            .map(|inner| inner.delegates.clone())
            .unwrap_or_default()
    }

    /// Snapshot of all registered collections.
    pub fn collections(&self) -> Vec<Arc<McpCollection>> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut collections: Vec<_> = inner
            .collections
            .values()
            .map(|(_, collection)| Arc::clone(collection))
            .collect();
        collections.sort_by(|a, b| {
            a.presentation
                .order
                .cmp(&b.presentation.order)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        collections
    }

    pub fn collection(&self, id: &CollectionId) -> Option<Arc<McpCollection>> {
        self.inner
            .lock()
            .ok()
            .and_then(|inner| inner.collections.get(id).map(|(_, c)| Arc::clone(c)))
    }

    /// Live definition view for one server.
    pub fn server_definition(
        &self,
        collection_id: &CollectionId,
        definition_id: &str,
    ) -> Option<McpServerDefinition> {
        let collection = self.collection(collection_id)?;
        collection
            .servers
            .with(|servers| servers.iter().find(|d| d.id == definition_id).cloned())
    }

    /// Force every pending lazy collection to load, then return the full
    /// set. Load failures leave the cached list in place.
    pub async fn discover_collections(&self) -> Vec<Arc<McpCollection>> {
        let pending: Vec<(CollectionId, Arc<dyn CollectionLoader>)> = {
            let Ok(inner) = self.inner.lock() else {
                return Vec::new();
            };
            inner
                .loaders
                .iter()
                .filter(|(id, _)| !inner.loaded.contains(*id))
                .map(|(id, loader)| (id.clone(), Arc::clone(loader)))
                .collect()
        };

        for (id, loader) in pending {
            match loader.load().await {
                Ok(definitions) => {
                    let collection = self.collection(&id);
                    if let Some(collection) = collection {
                        collection.servers.set(definitions);
                    }
                    if let Ok(mut inner) = self.inner.lock() {
                        inner.loaded.insert(id);
                    }
                    self.bump();
                }
                Err(e) => {
                    tracing::warn!(collection = %id, error = %e, "Lazy MCP collection failed to load");
                }
            }
        }

        self.collections()
    }

    /// Ensure one lazy collection finished loading. No-op for eager
    /// collections.
    pub async fn activate_collection(&self, collection_id: &CollectionId) {
        let loader = {
            let Ok(inner) = self.inner.lock() else { return };
            if inner.loaded.contains(collection_id) {
                return;
            }
            inner.loaders.get(collection_id).cloned()
        };
        let Some(loader) = loader else { return };

        match loader.load().await {
            Ok(definitions) => {
                if let Some(collection) = self.collection(collection_id) {
                    collection.servers.set(definitions);
                }
                if let Ok(mut inner) = self.inner.lock() {
                    inner.loaded.insert(collection_id.clone());
                }
                self.bump();
            }
            Err(e) => {
                tracing::warn!(collection = %collection_id, error = %e, "Lazy MCP collection failed to load");
            }
        }
    }

    /// Current trust decision for a collection. `None` means undecided.
    pub fn trust(&self, collection_id: &CollectionId) -> Option<bool> {
        let Ok(inner) = self.inner.lock() else {
            return None;
        };
        if let Some(decision) = inner.trust.get(collection_id) {
            return Some(*decision);
        }
        inner
            .collections
            .get(collection_id)
            .filter(|(_, c)| c.trusted_by_default)
            .map(|_| true)
    }

    /// Record a trust decision.
    pub fn set_trust(&self, collection_id: &CollectionId, trusted: bool) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.trust.insert(collection_id.clone(), trusted);
        }
        self.bump();
    }

    /// Persist a saved input (secret or user variable).
    pub async fn set_saved_input(&self, key: &str, scope: CollectionScope, value: String) {
        self.saved_inputs.set(key, scope, value).await;
    }

    pub async fn saved_input(&self, key: &str, scope: CollectionScope) -> Option<String> {
        self.saved_inputs.get(key, scope).await
    }

    /// Resolve an unstarted connection for a server definition.
    ///
    /// Runs the trust check (prompting when undecided), selects the
    /// transport delegate, and applies the debug launch rewrite when
    /// requested. `Ok(None)` means trust was declined or dismissed.
    pub async fn resolve_connection(
        &self,
        options: ResolveOptions,
    ) -> Result<Option<Connection>, McpError> {
        let collection = self.collection(&options.collection_id).ok_or_else(|| {
            McpError::NotFound(format!("collection '{}'", options.collection_id))
        })?;
        let definition = self
            .server_definition(&options.collection_id, &options.definition_id)
            .ok_or_else(|| {
                McpError::NotFound(format!(
                    "server '{}' in collection '{}'",
                    options.definition_id, options.collection_id
                ))
            })?;

        if !options.force_trust {
            let trusted = match self.trust(&options.collection_id) {
                Some(decision) => decision,
                None => {
                    let answer = self
                        .trust_prompt
                        .request_trust(&options.collection_id, &collection.label)
                        .await;
                    if let Some(decision) = answer {
                        self.set_trust(&options.collection_id, decision);
                    }
                    answer.unwrap_or(false)
                }
            };
            if !trusted {
                tracing::info!(
                    collection = %options.collection_id,
                    server = %definition.id,
                    "MCP server not started: collection is untrusted"
                );
                return Ok(None);
            }
        }

        let delegate = {
            let Ok(inner) = self.inner.lock() else {
                return Err(McpError::Internal("registry lock poisoned".to_string()));
            };
            inner
                .delegates
                .iter()
                .find(|d| d.can_start(&definition.launch))
                .cloned()
        };
        let Some(delegate) = delegate else {
            return Err(McpError::InvalidConfig(format!(
                "no transport delegate accepts server '{}'",
                definition.id
            )));
        };
        tracing::debug!(
            server = %definition.id,
            delegate = delegate.name(),
            "Resolved MCP transport delegate"
        );

        let debug_config = definition
            .dev_mode
            .as_ref()
            .and_then(|dev| dev.debug.as_ref())
            .filter(|_| options.debug);
        let launch = match debug_config {
            Some(debug) => devmode::debug_launch(&definition.launch, debug)?,
            None => definition.launch.clone(),
        };

        Ok(Some(Connection::new(
            definition.id.clone(),
            definition.label.clone(),
            launch,
            definition.roots.clone(),
        )))
    }
}

/// Scoped collection registration; dropping it deregisters the
/// collection.
pub struct RegistrationHandle {
    registry: Weak<McpCollectionRegistry>,
    collection_id: CollectionId,
    serial: u64,
}

impl RegistrationHandle {
    pub fn collection_id(&self) -> &CollectionId {
        &self.collection_id
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(&self.collection_id, self.serial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcpd_core::events::NoopEmitter;
    use mcpd_core::ports::{AlwaysTrust, MemorySavedInputs};

    fn test_registry() -> Arc<McpCollectionRegistry> {
        McpCollectionRegistry::new(
            Arc::new(AlwaysTrust),
            Arc::new(MemorySavedInputs::new()),
            Arc::new(NoopEmitter::new()),
        )
    }

    fn stdio_definition(id: &str) -> McpServerDefinition {
        McpServerDefinition::new(
            id,
            id,
            McpServerLaunch::Stdio {
                command: "server".to_string(),
                args: vec![],
                cwd: None,
                env: Default::default(),
                env_file: None,
            },
        )
    }

    fn collection(id: &str, servers: Vec<McpServerDefinition>) -> McpCollection {
        McpCollection::new(CollectionId::new(id), id, servers)
    }

    struct DenyAll;

    #[async_trait]
    impl TrustPrompt for DenyAll {
        async fn request_trust(&self, _id: &CollectionId, _label: &str) -> Option<bool> {
            Some(false)
        }
    }

    struct StaticLoader(Vec<McpServerDefinition>);

    #[async_trait]
    impl CollectionLoader for StaticLoader {
        async fn load(&self) -> Result<Vec<McpServerDefinition>, String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_registration_handle_deregisters_on_drop() {
        let registry = test_registry();
        let handle = registry.register_collection(collection("a", vec![]), None);
        assert_eq!(registry.collections().len(), 1);

        drop(handle);
        assert!(registry.collections().is_empty());
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_deregister_replacement() {
        let registry = test_registry();
        let first = registry.register_collection(collection("a", vec![]), None);
        let second =
            registry.register_collection(collection("a", vec![stdio_definition("s")]), None);

        // Dropping the superseded handle leaves the replacement alone.
        drop(first);
        assert_eq!(registry.collections().len(), 1);
        assert_eq!(
            registry
                .collection(&CollectionId::new("a"))
                .unwrap()
                .servers
                .with(Vec::len),
            1
        );

        drop(second);
        assert!(registry.collections().is_empty());
    }

    struct TrackedLoader {
        definitions: Vec<McpServerDefinition>,
        removed: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl CollectionLoader for TrackedLoader {
        async fn load(&self) -> Result<Vec<McpServerDefinition>, String> {
            Ok(self.definitions.clone())
        }

        async fn removed(&self) {
            self.removed
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }
    }

    async fn wait_for_count(counter: &Arc<std::sync::atomic::AtomicUsize>, expected: usize) {
        for _ in 0..100 {
            if counter.load(std::sync::atomic::Ordering::SeqCst) == expected {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_unloaded_loader_is_told_about_removal() {
        let registry = test_registry();
        let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = registry.register_collection(
            collection("lazy", vec![]).with_lazy(false),
            Some(Arc::new(TrackedLoader {
                definitions: vec![],
                removed: removed.clone(),
            })),
        );

        drop(handle);
        wait_for_count(&removed, 1).await;
        assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loaded_collection_removal_skips_loader_callback() {
        let registry = test_registry();
        let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let handle = registry.register_collection(
            collection("lazy", vec![]).with_lazy(false),
            Some(Arc::new(TrackedLoader {
                definitions: vec![stdio_definition("s")],
                removed: removed.clone(),
            })),
        );

        registry.discover_collections().await;
        drop(handle);
        tokio::task::yield_now().await;
        assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_handle_does_not_notify_replacement_loader() {
        let registry = test_registry();
        let removed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let first = registry.register_collection(
            collection("lazy", vec![]).with_lazy(false),
            Some(Arc::new(TrackedLoader {
                definitions: vec![],
                removed: removed.clone(),
            })),
        );
        let second = registry.register_collection(
            collection("lazy", vec![]).with_lazy(false),
            Some(Arc::new(TrackedLoader {
                definitions: vec![],
                removed: removed.clone(),
            })),
        );

        drop(first);
        tokio::task::yield_now().await;
        assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 0);

        drop(second);
        wait_for_count(&removed, 1).await;
        assert_eq!(removed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_resolve_unknown_server_is_not_found() {
        let registry = test_registry();
        let _handle = registry.register_collection(collection("a", vec![]), None);

        let result = registry
            .resolve_connection(ResolveOptions {
                collection_id: CollectionId::new("a"),
                definition_id: "missing".to_string(),
                force_trust: false,
                debug: false,
            })
            .await;
        assert!(matches!(result, Err(McpError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_trust_decline_yields_no_connection() {
        let registry = McpCollectionRegistry::new(
            Arc::new(DenyAll),
            Arc::new(MemorySavedInputs::new()),
            Arc::new(NoopEmitter::new()),
        );
        let _handle =
            registry.register_collection(collection("a", vec![stdio_definition("s")]), None);

        let resolved = registry
            .resolve_connection(ResolveOptions {
                collection_id: CollectionId::new("a"),
                definition_id: "s".to_string(),
                force_trust: false,
                debug: false,
            })
            .await
            .unwrap();
        assert!(resolved.is_none());
        // The decline was remembered.
        assert_eq!(registry.trust(&CollectionId::new("a")), Some(false));
    }

    #[tokio::test]
    async fn test_force_trust_bypasses_prompt() {
        let registry = McpCollectionRegistry::new(
            Arc::new(DenyAll),
            Arc::new(MemorySavedInputs::new()),
            Arc::new(NoopEmitter::new()),
        );
        let _handle =
            registry.register_collection(collection("a", vec![stdio_definition("s")]), None);

        let resolved = registry
            .resolve_connection(ResolveOptions {
                collection_id: CollectionId::new("a"),
                definition_id: "s".to_string(),
                force_trust: true,
                debug: false,
            })
            .await
            .unwrap();
        assert!(resolved.is_some());
    }

    #[tokio::test]
    async fn test_trusted_by_default_collection_needs_no_prompt() {
        let registry = McpCollectionRegistry::new(
            Arc::new(DenyAll),
            Arc::new(MemorySavedInputs::new()),
            Arc::new(NoopEmitter::new()),
        );
        let _handle = registry.register_collection(
            collection("a", vec![stdio_definition("s")]).trusted(),
            None,
        );

        assert_eq!(registry.trust(&CollectionId::new("a")), Some(true));
        let resolved = registry
            .resolve_connection(ResolveOptions {
                collection_id: CollectionId::new("a"),
                definition_id: "s".to_string(),
                force_trust: false,
                debug: false,
            })
            .await
            .unwrap();
        assert!(resolved.is_some());
    }

    #[tokio::test]
    async fn test_discover_resolves_lazy_collections() {
        let registry = test_registry();
        let _handle = registry.register_collection(
            collection("lazy", vec![]).with_lazy(false),
            Some(Arc::new(StaticLoader(vec![stdio_definition("s")]))),
        );

        let collections = registry.discover_collections().await;
        assert_eq!(collections.len(), 1);
        assert_eq!(collections[0].servers.with(Vec::len), 1);
    }

    #[tokio::test]
    async fn test_saved_inputs_round_trip() {
        let registry = test_registry();
        registry
            .set_saved_input("api-key", CollectionScope::Profile, "secret".to_string())
            .await;

        assert_eq!(
            registry
                .saved_input("api-key", CollectionScope::Profile)
                .await
                .as_deref(),
            Some("secret")
        );
        assert!(
            registry
                .saved_input("api-key", CollectionScope::Workspace)
                .await
                .is_none()
        );
    }
}
