//! Config-file discovery: reads `mcp.json`-style files, registers their
//! servers as a collection, and keeps it in sync with file changes.
//!
//! Parse failures are swallowed (the user is mid-edit more often than
//! not); a missing file is an expected state and is not logged. A file
//! with zero servers deregisters the collection.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use mcpd_core::domain::{
    CollectionScope, DebugConfig, DevModeConfig, McpCollection, McpServerDefinition,
    McpServerLaunch,
};
use mcpd_core::domain::CollectionId;
use notify::{RecursiveMode, Watcher};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::registry::{McpCollectionRegistry, RegistrationHandle};

/// Delay between a file event and the re-read, absorbing editor
/// write bursts.
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(300);

/// One watched config file.
#[derive(Debug, Clone)]
pub struct ConfigFileSource {
    pub collection_id: CollectionId,
    pub label: String,
    pub path: PathBuf,
    pub scope: CollectionScope,
    pub trusted_by_default: bool,
    /// Presentation order among collections.
    pub order: i32,
    /// Root attached to every definition (the workspace folder for
    /// workspace-scoped files).
    pub default_root: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    servers: BTreeMap<String, Value>,
    /// Claude Desktop / Cursor / Windsurf spelling.
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, Value>,
    #[serde(default)]
    inputs: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RawServer {
    #[serde(rename = "type")]
    kind: Option<String>,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    cwd: Option<PathBuf>,
    #[serde(default)]
    env: BTreeMap<String, Option<String>>,
    #[serde(rename = "envFile")]
    env_file: Option<PathBuf>,
    url: Option<String>,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    dev: Option<RawDev>,
}

#[derive(Debug, Deserialize)]
struct RawDev {
    watch: Option<WatchPatterns>,
    debug: Option<DebugConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WatchPatterns {
    One(String),
    Many(Vec<String>),
}

/// Parsed config file content.
#[derive(Debug, Default)]
pub struct ParsedConfig {
    pub definitions: Vec<McpServerDefinition>,
    /// Declared input variables, passed through for the host's prompt
    /// flow.
    pub inputs: Vec<Value>,
}

/// Parse an `mcp.json`-style document. Individually broken server
/// entries are skipped with a warning; a broken document is an error.
pub fn parse_config(text: &str) -> Result<ParsedConfig, String> {
    let raw: RawConfig = serde_json::from_str(text).map_err(|e| e.to_string())?;

    let entries = if raw.servers.is_empty() {
        raw.mcp_servers
    } else {
        raw.servers
    };

    let mut definitions = Vec::with_capacity(entries.len());
    for (name, value) in entries {
        match parse_server(&name, value) {
            Ok(definition) => definitions.push(definition),
            Err(e) => {
                tracing::warn!(server = %name, error = %e, "Skipping invalid MCP server entry");
            }
        }
    }

    Ok(ParsedConfig {
        definitions,
        inputs: raw.inputs,
    })
}

fn parse_server(name: &str, value: Value) -> Result<McpServerDefinition, String> {
    let raw: RawServer = serde_json::from_value(value).map_err(|e| e.to_string())?;

    let launch = match raw.kind.as_deref() {
        Some("stdio") | None if raw.command.is_some() => McpServerLaunch::Stdio {
            command: raw.command.unwrap_or_default(),
            args: raw.args,
            cwd: raw.cwd,
            env: raw.env,
            env_file: raw.env_file,
        },
        Some("http" | "sse") => McpServerLaunch::Http {
            url: raw.url.ok_or("server is missing 'url'")?,
            headers: raw.headers.into_iter().collect(),
        },
        None if raw.url.is_some() => McpServerLaunch::Http {
            url: raw.url.unwrap_or_default(),
            headers: raw.headers.into_iter().collect(),
        },
        Some(other) => return Err(format!("unknown server type '{other}'")),
        None => return Err("server needs either 'command' or 'url'".to_string()),
    };
    launch.validate()?;

    let mut definition = McpServerDefinition::new(name, name, launch);
    if let Some(dev) = raw.dev {
        let watch = match dev.watch {
            Some(WatchPatterns::One(pattern)) => vec![pattern],
            Some(WatchPatterns::Many(patterns)) => patterns,
            None => Vec::new(),
        };
        definition = definition.with_dev_mode(DevModeConfig {
            watch,
            debug: dev.debug,
        });
    }
    Ok(definition)
}

/// Watches one config file and mirrors it into the registry.
pub struct ConfigFileAdapter {
    task: tokio::task::JoinHandle<()>,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl ConfigFileAdapter {
    /// Load the file now and keep reloading on changes until dropped.
    pub fn spawn(registry: Arc<McpCollectionRegistry>, source: ConfigFileSource) -> Self {
        let (tx, mut rx) = mpsc::channel::<()>(8);

        let watched_file = source.path.clone();
        let watcher = source.path.parent().and_then(|parent| {
            let mut watcher = notify::recommended_watcher(
                move |event: Result<notify::Event, notify::Error>| {
                    let Ok(event) = event else { return };
                    if event.paths.iter().any(|p| p == &watched_file) {
                        let _ = tx.try_send(());
                    }
                },
            )
            .ok()?;
            watcher.watch(parent, RecursiveMode::NonRecursive).ok()?;
            Some(watcher)
        });

        let task = tokio::spawn(async move {
            let mut handle: Option<RegistrationHandle> = None;
            reload(&registry, &source, &mut handle).await;
            loop {
                if rx.recv().await.is_none() {
                    return;
                }
                // Debounce: wait for the file to settle.
                loop {
                    match tokio::time::timeout(RELOAD_DEBOUNCE, rx.recv()).await {
                        Ok(Some(())) => {}
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                reload(&registry, &source, &mut handle).await;
            }
        });

        Self {
            task,
            _watcher: watcher,
        }
    }
}

impl Drop for ConfigFileAdapter {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn reload(
    registry: &Arc<McpCollectionRegistry>,
    source: &ConfigFileSource,
    handle: &mut Option<RegistrationHandle>,
) {
    let text = match tokio::fs::read_to_string(&source.path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // Expected for hosts that are not installed.
            *handle = None;
            return;
        }
        Err(e) => {
            tracing::warn!(path = %source.path.display(), error = %e, "Failed to read MCP config file");
            return;
        }
    };

    let parsed = match parse_config(&text) {
        Ok(parsed) => parsed,
        Err(e) => {
            // Likely a half-saved edit; keep the previous registration.
            tracing::debug!(path = %source.path.display(), error = %e, "Ignoring unparseable MCP config file");
            return;
        }
    };

    if parsed.definitions.is_empty() {
        *handle = None;
        return;
    }

    let definitions: Vec<McpServerDefinition> = parsed
        .definitions
        .into_iter()
        .map(|mut definition| {
            if let Some(root) = &source.default_root {
                definition.roots = vec![root.clone()];
            }
            definition.presentation.origin = Some(source.path.clone());
            definition
        })
        .collect();

    let mut collection = McpCollection::new(
        source.collection_id.clone(),
        source.label.clone(),
        definitions,
    )
    .with_scope(source.scope)
    .with_origin(source.path.clone());
    collection.presentation.order = source.order;
    if source.trusted_by_default {
        collection = collection.trusted();
    }

    // Register the fresh snapshot before releasing the previous handle;
    // stale handles cannot deregister their replacement.
    let next = registry.register_collection(collection, None);
    *handle = Some(next);
}
