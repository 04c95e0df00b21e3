//! Top-level service: reconciles the registered collections into managed
//! servers and projects their tools into the host tool registry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mcpd_core::domain::{CollectionId, McpCacheState, McpServerDefinition, McpTool};
use mcpd_core::events::RegistryEventEmitter;
use mcpd_core::ports::{RegisteredTool, ToolRegistry, UserNotifier};

use crate::cache::McpMetadataCache;
use crate::connection::HostCallbacks;
use crate::devmode::DevModeAttacher;
use crate::registry::McpCollectionRegistry;
use crate::server::{McpServer, StartOptions};
use crate::tool_name::{McpPrefixGenerator, qualified_tool_id};

/// Delay between a collection change and reconciliation, absorbing
/// bursts of registrations into one pass.
const RECONCILE_DEBOUNCE: Duration = Duration::from_millis(500);

/// Identity of one managed server within a reconciliation generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ServerKey {
    collection_id: CollectionId,
    definition_id: String,
    prefix: String,
}

type RegisteredSet = Arc<std::sync::Mutex<HashMap<String, RegisteredTool>>>;

struct ManagedServer {
    server: Arc<McpServer>,
    definition: McpServerDefinition,
    registered: RegisteredSet,
    sync_task: tokio::task::JoinHandle<()>,
    _attacher: Option<DevModeAttacher>,
}

/// Orchestrates servers over the full collection set.
pub struct McpService {
    registry: Arc<McpCollectionRegistry>,
    cache: Arc<McpMetadataCache>,
    notifier: Arc<dyn UserNotifier>,
    tool_registry: Arc<dyn ToolRegistry>,
    emitter: Arc<dyn RegistryEventEmitter>,
    callbacks: HostCallbacks,
    servers: tokio::sync::Mutex<HashMap<ServerKey, ManagedServer>>,
    reconciler: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl McpService {
    pub fn new(
        registry: Arc<McpCollectionRegistry>,
        cache: Arc<McpMetadataCache>,
        notifier: Arc<dyn UserNotifier>,
        tool_registry: Arc<dyn ToolRegistry>,
        emitter: Arc<dyn RegistryEventEmitter>,
        callbacks: HostCallbacks,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            cache,
            notifier,
            tool_registry,
            emitter,
            callbacks,
            servers: tokio::sync::Mutex::new(HashMap::new()),
            reconciler: std::sync::Mutex::new(None),
        })
    }

    /// Start the background reconciler: every collection or definition
    /// change triggers a debounced [`Self::update_collected_servers`].
    pub fn watch_collections(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let mut changes = self.registry.subscribe();
        let task = tokio::spawn(async move {
            loop {
                if changes.changed().await.is_err() {
                    return;
                }
                // Absorb further changes until the set settles.
                loop {
                    match tokio::time::timeout(RECONCILE_DEBOUNCE, changes.changed()).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) => return,
                        Err(_) => break,
                    }
                }
                let Some(service) = weak.upgrade() else { return };
                service.update_collected_servers().await;
            }
        });
        if let Ok(mut slot) = self.reconciler.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    /// Reconcile managed servers against the current collection set.
    ///
    /// Unchanged definitions keep their server (and its connection);
    /// a definition whose launch, roots, or dev mode changed is torn
    /// down and recreated. Idempotent when nothing changed.
    pub async fn update_collected_servers(self: &Arc<Self>) {
        let collections = self.registry.collections();
        let mut generator = McpPrefixGenerator::new();
        let mut desired: Vec<(ServerKey, McpServerDefinition)> = Vec::new();
        for collection in &collections {
            for definition in collection.servers.get() {
                let prefix = generator.prefix_for(&definition.label);
                desired.push((
                    ServerKey {
                        collection_id: collection.id.clone(),
                        definition_id: definition.id.clone(),
                        prefix,
                    },
                    definition,
                ));
            }
        }

        let mut managed = self.servers.lock().await;

        let desired_keys: HashSet<&ServerKey> = desired.iter().map(|(key, _)| key).collect();
        let removed: Vec<ServerKey> = managed
            .keys()
            .filter(|key| !desired_keys.contains(key))
            .cloned()
            .collect();
        for key in removed {
            if let Some(entry) = managed.remove(&key) {
                tracing::debug!(server = %key.definition_id, "Removing MCP server");
                self.dispose_managed(entry);
            }
        }

        for (key, definition) in desired {
            match managed.get_mut(&key) {
                Some(entry) if entry.definition.connection_equal(&definition) => {
                    // Presentation-only change; the connection survives.
                    entry.definition = definition;
                }
                Some(_) => {
                    tracing::debug!(server = %key.definition_id, "MCP server definition changed; recreating");
                    if let Some(entry) = managed.remove(&key) {
                        self.dispose_managed(entry);
                    }
                    let entry = self.create_managed(&key, definition);
                    managed.insert(key, entry);
                }
                None => {
                    tracing::debug!(server = %key.definition_id, "Managing new MCP server");
                    let entry = self.create_managed(&key, definition);
                    managed.insert(key, entry);
                }
            }
        }
    }

    fn create_managed(
        self: &Arc<Self>,
        key: &ServerKey,
        definition: McpServerDefinition,
    ) -> ManagedServer {
        let server = McpServer::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.cache),
            Arc::clone(&self.notifier),
            Arc::clone(&self.emitter),
            self.callbacks.clone(),
            key.collection_id.clone(),
            key.definition_id.clone(),
            definition.label.clone(),
        );

        let registered: RegisteredSet = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let sync_task = self.spawn_tool_sync(&server, key, Arc::clone(&registered));
        let attacher = DevModeAttacher::attach(&server, &definition);

        ManagedServer {
            server,
            definition,
            registered,
            sync_task,
            _attacher: attacher,
        }
    }

    /// Mirror one server's tools into the host registry, diffing by tool
    /// id with deletions applied before insertions.
    fn spawn_tool_sync(
        &self,
        server: &Arc<McpServer>,
        key: &ServerKey,
        registered: RegisteredSet,
    ) -> tokio::task::JoinHandle<()> {
        let tool_registry = Arc::clone(&self.tool_registry);
        let key = key.clone();
        let mut tools_rx = server.subscribe_tools();
        tokio::spawn(async move {
            loop {
                let tools = tools_rx.borrow_and_update().clone();
                let next = project_tools(&key, &tools);
                let (removals, additions) = {
                    let Ok(current) = registered.lock() else { return };
                    diff_tools(&current, &next)
                };
                for id in &removals {
                    tool_registry.unregister(id);
                }
                for tool in &additions {
                    tool_registry.register(tool.clone());
                }
                if let Ok(mut current) = registered.lock() {
                    *current = next.into_iter().map(|t| (t.id.clone(), t)).collect();
                }
                if tools_rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    fn dispose_managed(&self, entry: ManagedServer) {
        entry.sync_task.abort();
        if let Ok(mut current) = entry.registered.lock() {
            for id in current.keys() {
                self.tool_registry.unregister(id);
            }
            current.clear();
        }
        entry.server.dispose();
    }

    /// Force lazy collections to resolve, reconcile, then eagerly start
    /// every server whose capabilities were never collected.
    pub async fn activate_collections(self: &Arc<Self>) {
        self.registry.discover_collections().await;
        self.update_collected_servers().await;

        let unknown: Vec<Arc<McpServer>> = {
            let managed = self.servers.lock().await;
            managed
                .values()
                .filter(|entry| entry.server.cache_state() == McpCacheState::Unknown)
                .map(|entry| Arc::clone(&entry.server))
                .collect()
        };
        for server in unknown {
            tokio::spawn(async move {
                server.start(StartOptions::default()).await;
            });
        }
    }

    /// Find a managed server.
    pub async fn server(
        &self,
        collection_id: &CollectionId,
        definition_id: &str,
    ) -> Option<Arc<McpServer>> {
        let managed = self.servers.lock().await;
        managed
            .iter()
            .find(|(key, _)| {
                &key.collection_id == collection_id && key.definition_id == definition_id
            })
            .map(|(_, entry)| Arc::clone(&entry.server))
    }

    /// Snapshot of all managed servers.
    pub async fn servers(&self) -> Vec<Arc<McpServer>> {
        let managed = self.servers.lock().await;
        managed.values().map(|e| Arc::clone(&e.server)).collect()
    }

    /// Persist the metadata cache; called on the host's about-to-persist
    /// signal.
    pub async fn flush_cache(&self) {
        if let Err(e) = self.cache.flush().await {
            tracing::warn!(error = %e, "Failed to persist MCP metadata cache");
        }
    }

    /// Tear down every managed server and stop reconciling.
    pub async fn dispose(&self) {
        if let Some(task) = self.reconciler.lock().ok().and_then(|mut t| t.take()) {
            task.abort();
        }
        let mut managed = self.servers.lock().await;
        for (_, entry) in managed.drain() {
            self.dispose_managed(entry);
        }
    }
}

fn project_tools(key: &ServerKey, tools: &[McpTool]) -> Vec<RegisteredTool> {
    tools
        .iter()
        .map(|tool| RegisteredTool {
            id: qualified_tool_id(&key.prefix, &tool.name),
            collection_id: key.collection_id.clone(),
            definition_id: key.definition_id.clone(),
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: tool.input_schema.clone(),
        })
        .collect()
}

/// Ids to unregister and tools to (re)register, in that order. A tool is
/// re-registered when its definition changed under the same id.
fn diff_tools(
    current: &HashMap<String, RegisteredTool>,
    next: &[RegisteredTool],
) -> (Vec<String>, Vec<RegisteredTool>) {
    let next_ids: HashSet<&str> = next.iter().map(|t| t.id.as_str()).collect();
    let removals: Vec<String> = current
        .keys()
        .filter(|id| !next_ids.contains(id.as_str()))
        .cloned()
        .collect();
    let additions: Vec<RegisteredTool> = next
        .iter()
        .filter(|&tool| current.get(&tool.id) != Some(tool))
        .cloned()
        .collect();
    (removals, additions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcpd_core::domain::{McpCollection, McpServerLaunch};
    use mcpd_core::events::NoopEmitter;
    use mcpd_core::ports::{
        AlwaysTrust, MemorySavedInputs, MemoryStorage, NoopNotifier,
    };
    use serde_json::json;

    /// Records registry operations in order.
    #[derive(Default)]
    struct RecordingToolRegistry {
        ops: std::sync::Mutex<Vec<String>>,
    }

    impl ToolRegistry for RecordingToolRegistry {
        fn register(&self, tool: RegisteredTool) {
            if let Ok(mut ops) = self.ops.lock() {
                ops.push(format!("+{}", tool.id));
            }
        }

        fn unregister(&self, id: &str) {
            if let Ok(mut ops) = self.ops.lock() {
                ops.push(format!("-{id}"));
            }
        }
    }

    fn definition(id: &str, label: &str, command: &str) -> McpServerDefinition {
        McpServerDefinition::new(
            id,
            label,
            McpServerLaunch::Stdio {
                command: command.to_string(),
                args: vec![],
                cwd: None,
                env: Default::default(),
                env_file: None,
            },
        )
    }

    fn service_fixture() -> (Arc<McpService>, Arc<McpCollectionRegistry>, Arc<RecordingToolRegistry>) {
        let registry = McpCollectionRegistry::new(
            Arc::new(AlwaysTrust),
            Arc::new(MemorySavedInputs::new()),
            Arc::new(NoopEmitter::new()),
        );
        let tools = Arc::new(RecordingToolRegistry::default());
        let service = McpService::new(
            Arc::clone(&registry),
            Arc::new(McpMetadataCache::new(Arc::new(MemoryStorage::new()))),
            Arc::new(NoopNotifier::new()),
            Arc::clone(&tools) as Arc<dyn ToolRegistry>,
            Arc::new(NoopEmitter::new()),
            HostCallbacks::default(),
        );
        (service, registry, tools)
    }

    #[tokio::test]
    async fn test_reconciliation_is_idempotent() {
        let (service, registry, _) = service_fixture();
        let _handle = registry.register_collection(
            McpCollection::new(
                CollectionId::new("c"),
                "C",
                vec![definition("a", "Server A", "srv-a")],
            ),
            None,
        );

        service.update_collected_servers().await;
        let first = service.server(&CollectionId::new("c"), "a").await.unwrap();

        service.update_collected_servers().await;
        let second = service.server(&CollectionId::new("c"), "a").await.unwrap();

        // Same managed server instance across runs.
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(service.servers().await.len(), 1);
    }

    #[tokio::test]
    async fn test_label_change_keeps_connection() {
        let (service, registry, _) = service_fixture();
        let collection = McpCollection::new(
            CollectionId::new("c"),
            "C",
            vec![definition("a", "Server A", "srv-a")],
        );
        let _handle = registry.register_collection(collection, None);
        service.update_collected_servers().await;
        let first = service.server(&CollectionId::new("c"), "a").await.unwrap();

        // Same launch under the same label-derived prefix survives; only
        // presentation data changed.
        let updated = registry.collection(&CollectionId::new("c")).unwrap();
        let mut changed = definition("a", "Server A", "srv-a");
        changed.presentation.order = 5;
        updated.servers.set(vec![changed]);
        service.update_collected_servers().await;

        let second = service.server(&CollectionId::new("c"), "a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_launch_change_recreates_server() {
        let (service, registry, _) = service_fixture();
        let collection = McpCollection::new(
            CollectionId::new("c"),
            "C",
            vec![definition("a", "Server A", "srv-a")],
        );
        let _handle = registry.register_collection(collection, None);
        service.update_collected_servers().await;
        let first = service.server(&CollectionId::new("c"), "a").await.unwrap();

        let updated = registry.collection(&CollectionId::new("c")).unwrap();
        updated
            .servers
            .set(vec![definition("a", "Server A", "srv-b")]);
        service.update_collected_servers().await;

        let second = service.server(&CollectionId::new("c"), "a").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_removed_collection_disposes_servers() {
        let (service, registry, _) = service_fixture();
        let handle = registry.register_collection(
            McpCollection::new(
                CollectionId::new("c"),
                "C",
                vec![definition("a", "Server A", "srv-a")],
            ),
            None,
        );
        service.update_collected_servers().await;
        assert_eq!(service.servers().await.len(), 1);

        drop(handle);
        service.update_collected_servers().await;
        assert!(service.servers().await.is_empty());
    }

    #[test]
    fn test_diff_applies_deletions_before_insertions() {
        let key = ServerKey {
            collection_id: CollectionId::new("c"),
            definition_id: "a".to_string(),
            prefix: "srv_".to_string(),
        };
        let old = project_tools(&key, &[McpTool::new("alpha", "old")]);
        let current: HashMap<String, RegisteredTool> =
            old.into_iter().map(|t| (t.id.clone(), t)).collect();
        let next = project_tools(&key, &[McpTool::new("beta", "new")]);

        let (removals, additions) = diff_tools(&current, &next);
        assert_eq!(removals, vec!["srv_alpha".to_string()]);
        assert_eq!(additions.len(), 1);
        assert_eq!(additions[0].id, "srv_beta");
    }

    #[test]
    fn test_diff_reregisters_changed_tool_under_same_id() {
        let key = ServerKey {
            collection_id: CollectionId::new("c"),
            definition_id: "a".to_string(),
            prefix: "srv_".to_string(),
        };
        let current: HashMap<String, RegisteredTool> =
            project_tools(&key, &[McpTool::new("alpha", "old description")])
                .into_iter()
                .map(|t| (t.id.clone(), t))
                .collect();
        let next = project_tools(
            &key,
            &[McpTool::new("alpha", "new description")
                .with_input_schema(json!({ "type": "object" }))],
        );

        let (removals, additions) = diff_tools(&current, &next);
        assert!(removals.is_empty());
        assert_eq!(additions.len(), 1);
        assert_eq!(additions[0].description, "new description");
    }

    #[tokio::test]
    async fn test_colliding_labels_get_distinct_prefixes() {
        let (service, registry, _) = service_fixture();
        let _handle = registry.register_collection(
            McpCollection::new(
                CollectionId::new("c"),
                "C",
                vec![
                    definition("a", "My Server", "srv-a"),
                    definition("b", "My Server", "srv-b"),
                ],
            ),
            None,
        );
        service.update_collected_servers().await;

        let managed = service.servers.lock().await;
        let prefixes: HashSet<&str> =
            managed.keys().map(|key| key.prefix.as_str()).collect();
        assert_eq!(prefixes.len(), 2);
    }
}
