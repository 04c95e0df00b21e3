//! Host-installed server discovery.
//!
//! The host keeps its own persisted list of installed servers; this
//! adapter mirrors that list into collections, one per distinct origin
//! config file. Change bursts are throttled into a single rebuild.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mcpd_core::domain::{CollectionId, McpCollection, McpServerDefinition, McpServerLaunch};

use crate::registry::{McpCollectionRegistry, RegistrationHandle};

const REBUILD_THROTTLE: Duration = Duration::from_millis(1000);

/// One server from the host's installed list.
#[derive(Debug, Clone)]
pub struct InstalledServer {
    pub id: String,
    pub label: String,
    pub launch: McpServerLaunch,
    /// Config file the installation came from, when known.
    pub origin: Option<PathBuf>,
}

/// Mirrors the host's installed-server list into the registry.
pub struct InstalledDiscovery {
    registry: Arc<McpCollectionRegistry>,
    handles: Mutex<Vec<RegistrationHandle>>,
    latest: Mutex<Option<Vec<InstalledServer>>>,
    rebuild_scheduled: AtomicBool,
}

impl InstalledDiscovery {
    pub fn new(registry: Arc<McpCollectionRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            handles: Mutex::new(Vec::new()),
            latest: Mutex::new(None),
            rebuild_scheduled: AtomicBool::new(false),
        })
    }

    /// Accept a new installed list. Rebuilds are throttled; rapid calls
    /// coalesce and only the latest list is applied.
    pub fn update(self: &Arc<Self>, servers: Vec<InstalledServer>) {
        if let Ok(mut latest) = self.latest.lock() {
            *latest = Some(servers);
        }
        if self.rebuild_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(REBUILD_THROTTLE).await;
            this.rebuild_scheduled.store(false, Ordering::SeqCst);
            let servers = this.latest.lock().ok().and_then(|mut latest| latest.take());
            if let Some(servers) = servers {
                this.rebuild(servers);
            }
        });
    }

    fn rebuild(&self, servers: Vec<InstalledServer>) {
        // Group by origin; servers without one share a fallback
        // collection. BTreeMap keeps the grouping deterministic.
        let mut groups: BTreeMap<String, (Option<PathBuf>, Vec<McpServerDefinition>)> =
            BTreeMap::new();
        for server in servers {
            let key = server
                .origin
                .as_ref()
                .map_or_else(|| "default".to_string(), |path| origin_key(path));
            let mut definition =
                McpServerDefinition::new(server.id, server.label, server.launch);
            definition.presentation.origin = server.origin.clone();
            let entry = groups.entry(key).or_insert_with(|| (server.origin, Vec::new()));
            entry.1.push(definition);
        }

        let mut handles = Vec::with_capacity(groups.len());
        for (key, (origin, definitions)) in groups {
            let mut collection = McpCollection::new(
                CollectionId::new(format!("installed.{key}")),
                origin
                    .as_ref()
                    .and_then(|p| p.file_name())
                    .map_or_else(
                        || "Installed Servers".to_string(),
                        |name| name.to_string_lossy().into_owned(),
                    ),
                definitions,
            )
            .trusted();
            if let Some(origin) = origin {
                collection = collection.with_origin(origin);
            }
            handles.push(self.registry.register_collection(collection, None));
        }

        // Old handles drop after the replacements registered; stale
        // serials cannot deregister them.
        if let Ok(mut slot) = self.handles.lock() {
            *slot = handles;
        }
    }
}

/// Deterministic collection-id fragment for an origin path.
fn origin_key(path: &std::path::Path) -> String {
    let text = path.to_string_lossy();
    text.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect::<String>()
        .trim_matches('-')
        .to_string()
}
