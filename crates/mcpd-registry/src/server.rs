//! Server lifecycle: binds a (collection, definition) pair to a
//! connection, keeps the capability cache fresh, and funnels all RPC
//! access through a start-on-demand gate.

use std::sync::Arc;
use std::time::Instant;

use mcpd_core::domain::{
    CollectionId, ConnectionState, McpCacheState, McpPrompt, McpServerLaunch, McpTool,
    McpToolResult, ServerCapabilities, ServerMetadataEntry,
};
use mcpd_core::events::{RegistryEvent, RegistryEventEmitter};
use mcpd_core::observable::ObservableValue;
use mcpd_core::ports::{McpError, Remediation, Severity, UserNotifier};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::McpMetadataCache;
use crate::client::McpClientError;
use crate::connection::{Connection, HostCallbacks, McpSession, WireTool};
use crate::registry::{McpCollectionRegistry, ResolveOptions};
use crate::tool_name;

/// How a start was requested.
#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    /// User-triggered: errors surface through the notifier with
    /// remediation. Background starts only log.
    pub interactive: bool,
    /// Attach a debugger per the definition's dev-mode configuration.
    pub debug: bool,
}

/// One managed MCP server.
pub struct McpServer {
    pub collection_id: CollectionId,
    pub definition_id: String,
    pub label: String,
    registry: Arc<McpCollectionRegistry>,
    cache: Arc<McpMetadataCache>,
    notifier: Arc<dyn UserNotifier>,
    emitter: Arc<dyn RegistryEventEmitter>,
    callbacks: HostCallbacks,
    /// Serializes start/stop; tokio mutexes are FIFO-fair.
    start_lock: tokio::sync::Mutex<()>,
    connection: std::sync::Mutex<Option<Arc<Connection>>>,
    connection_state: ObservableValue<ConnectionState>,
    cache_state: ObservableValue<McpCacheState>,
    tools: ObservableValue<Vec<McpTool>>,
    prompts: ObservableValue<Vec<McpPrompt>>,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    populate_cancel: std::sync::Mutex<Option<CancellationToken>>,
}

impl McpServer {
    /// Create a server hydrated from the metadata cache: a matching
    /// snapshot publishes immediately as `Cached`, a stale one as
    /// `Outdated`.
    pub fn new(
        registry: Arc<McpCollectionRegistry>,
        cache: Arc<McpMetadataCache>,
        notifier: Arc<dyn UserNotifier>,
        emitter: Arc<dyn RegistryEventEmitter>,
        callbacks: HostCallbacks,
        collection_id: CollectionId,
        definition_id: String,
        label: String,
    ) -> Arc<Self> {
        let nonce = registry
            .server_definition(&collection_id, &definition_id)
            .map(|d| d.cache_nonce());
        let (cache_state, tools, prompts) = match cache.get(&definition_id) {
            Some(entry) if Some(&entry.nonce) == nonce.as_ref() => {
                (McpCacheState::Cached, entry.tools, entry.prompts)
            }
            Some(entry) => (McpCacheState::Outdated, entry.tools, entry.prompts),
            None => (McpCacheState::Unknown, Vec::new(), Vec::new()),
        };

        Arc::new(Self {
            collection_id,
            definition_id,
            label,
            registry,
            cache,
            notifier,
            emitter,
            callbacks,
            start_lock: tokio::sync::Mutex::new(()),
            connection: std::sync::Mutex::new(None),
            connection_state: ObservableValue::new(ConnectionState::Stopped),
            cache_state: ObservableValue::new(cache_state),
            tools: ObservableValue::new(tools),
            prompts: ObservableValue::new(prompts),
            tasks: std::sync::Mutex::new(Vec::new()),
            populate_cancel: std::sync::Mutex::new(None),
        })
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state.get()
    }

    pub fn subscribe_connection_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.connection_state.subscribe()
    }

    pub fn cache_state(&self) -> McpCacheState {
        self.cache_state.get()
    }

    pub fn subscribe_cache_state(&self) -> tokio::sync::watch::Receiver<McpCacheState> {
        self.cache_state.subscribe()
    }

    pub fn tools(&self) -> Vec<McpTool> {
        self.tools.get()
    }

    pub fn subscribe_tools(&self) -> tokio::sync::watch::Receiver<Vec<McpTool>> {
        self.tools.subscribe()
    }

    pub fn prompts(&self) -> Vec<McpPrompt> {
        self.prompts.get()
    }

    fn session(&self) -> Option<Arc<McpSession>> {
        self.connection
            .lock()
            .ok()
            .and_then(|c| c.as_ref().and_then(|conn| conn.session()))
    }

    /// Subscribe to server-pushed resource-update URIs on the current
    /// connection, if one is live.
    pub fn subscribe_resource_updates(
        &self,
    ) -> Option<tokio::sync::broadcast::Receiver<String>> {
        self.connection
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|conn| conn.subscribe_resource_updates()))
    }

    fn set_connection_state(&self, state: ConnectionState) {
        if self.connection_state.set(state.clone()) {
            self.emitter.emit(RegistryEvent::ConnectionStateChanged {
                definition_id: self.definition_id.clone(),
                state,
            });
        }
    }

    fn set_cache_state(&self, state: McpCacheState) {
        if self.cache_state.set(state) {
            self.emitter.emit(RegistryEvent::CacheStateChanged {
                definition_id: self.definition_id.clone(),
                state,
            });
        }
    }

    /// Start (or join) the server. Serialized per server; concurrent
    /// callers observe the outcome of the winning start.
    pub async fn start(self: &Arc<Self>, options: StartOptions) -> ConnectionState {
        let _guard = self.start_lock.lock().await;

        // A live or in-flight connection wins; only a startable one is
        // replaced.
        let existing = self.connection.lock().ok().and_then(|c| c.clone());
        if let Some(connection) = existing {
            let state = connection.state();
            if !state.is_startable() {
                return state;
            }
            connection.stop();
            if let Ok(mut slot) = self.connection.lock() {
                *slot = None;
            }
        }

        // Lazy collections must have resolved before the definition can
        // be looked up.
        self.registry.activate_collection(&self.collection_id).await;

        let resolved = self
            .registry
            .resolve_connection(ResolveOptions {
                collection_id: self.collection_id.clone(),
                definition_id: self.definition_id.clone(),
                force_trust: false,
                debug: options.debug,
            })
            .await;

        let connection = match resolved {
            Ok(Some(connection)) => Arc::new(connection),
            Ok(None) => {
                // Trust declined or dismissed: a normal stop, not an
                // error.
                self.set_connection_state(ConnectionState::Stopped);
                return ConnectionState::Stopped;
            }
            Err(e) => {
                let message = e.to_string();
                self.report_start_failure(&message, false, options.interactive);
                let state = ConnectionState::Error(message);
                self.set_connection_state(state.clone());
                return state;
            }
        };

        if let Ok(mut slot) = self.connection.lock() {
            *slot = Some(Arc::clone(&connection));
        }
        self.spawn_connection_watchers(&connection);

        let started_at = Instant::now();
        match connection.start(self.callbacks.clone()).await {
            Ok(()) => {
                tracing::info!(
                    server = %self.definition_id,
                    elapsed_ms = started_at.elapsed().as_millis() as u64,
                    "MCP server connected"
                );
                self.set_connection_state(ConnectionState::Running);
                let this = Arc::clone(self);
                let task = tokio::spawn(async move {
                    this.populate_live_data().await;
                });
                if let Ok(mut tasks) = self.tasks.lock() {
                    tasks.push(task);
                }
                ConnectionState::Running
            }
            Err(e) => {
                let missing_binary = e.is_missing_binary();
                let message = e.to_string();
                self.report_start_failure(&message, missing_binary, options.interactive);
                let state = ConnectionState::Error(message);
                self.set_connection_state(state.clone());
                state
            }
        }
    }

    /// Stop the connection if one exists.
    pub async fn stop(&self) {
        let _guard = self.start_lock.lock().await;
        if let Some(token) = self.populate_cancel.lock().ok().and_then(|mut t| t.take()) {
            token.cancel();
        }
        let connection = self.connection.lock().ok().and_then(|mut c| c.take());
        if let Some(connection) = connection {
            connection.stop();
        }
        self.set_connection_state(ConnectionState::Stopped);
    }

    /// Drop all background work. The server is unusable afterwards.
    pub fn dispose(&self) {
        if let Some(token) = self.populate_cancel.lock().ok().and_then(|mut t| t.take()) {
            token.cancel();
        }
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let connection = self.connection.lock().ok().and_then(|mut c| c.take());
        if let Some(connection) = connection {
            connection.stop();
        }
        self.connection_state.set(ConnectionState::Stopped);
    }

    fn spawn_connection_watchers(self: &Arc<Self>, connection: &Arc<Connection>) {
        let mut handles = Vec::with_capacity(3);

        // Mirror the connection state into the server-level observable.
        let weak = Arc::downgrade(self);
        let mut state_rx = connection.subscribe_state();
        handles.push(tokio::spawn(async move {
            loop {
                let state = state_rx.borrow_and_update().clone();
                let Some(server) = weak.upgrade() else { return };
                server.set_connection_state(state);
                drop(server);
                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        }));

        // Re-fetch capability lists when the server announces changes.
        for mut generation_rx in [
            connection.subscribe_tools_changed(),
            connection.subscribe_prompts_changed(),
        ] {
            let weak = Arc::downgrade(self);
            handles.push(tokio::spawn(async move {
                generation_rx.mark_unchanged();
                while generation_rx.changed().await.is_ok() {
                    let Some(server) = weak.upgrade() else { return };
                    server.populate_live_data().await;
                }
            }));
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.extend(handles);
        }
    }

    /// Fetch tool and prompt lists from the live session, normalize
    /// them, publish, and snapshot into the metadata cache.
    pub async fn populate_live_data(self: &Arc<Self>) {
        let token = CancellationToken::new();
        if let Ok(mut slot) = self.populate_cancel.lock() {
            if let Some(previous) = slot.replace(token.clone()) {
                previous.cancel();
            }
        }
        let Some(session) = self.session() else {
            return;
        };

        self.set_cache_state(self.cache_state.get().to_refreshing());

        let capabilities = session.capabilities();
        let fetch = async {
            let tools = if capabilities.contains(ServerCapabilities::TOOLS) {
                session.list_tools().await?
            } else {
                Vec::new()
            };
            let prompts = if capabilities.contains(ServerCapabilities::PROMPTS) {
                session.list_prompts().await?
            } else {
                Vec::new()
            };
            Ok::<_, McpClientError>((tools, prompts))
        };
        let outcome = tokio::select! {
            () = token.cancelled() => return,
            outcome = fetch => outcome,
        };

        match outcome {
            Ok((wire_tools, prompts)) => {
                let total = wire_tools.len();
                let (tools, dropped) = normalize_tools(wire_tools);
                if !dropped.is_empty() {
                    tracing::warn!(
                        server = %self.definition_id,
                        dropped = dropped.len(),
                        total,
                        tools = ?dropped,
                        "Dropped MCP tools with invalid input schemas"
                    );
                }

                let identity = session.identity().clone();
                if let Some(definition) = self
                    .registry
                    .server_definition(&self.collection_id, &self.definition_id)
                {
                    self.cache.store(
                        &self.definition_id,
                        ServerMetadataEntry {
                            collected_at: chrono::Utc::now(),
                            server_name: identity.name,
                            server_instructions: identity.instructions,
                            nonce: definition.cache_nonce(),
                            tools: tools.clone(),
                            prompts: prompts.clone(),
                            capabilities,
                        },
                    );
                }

                let count = tools.len();
                if self.tools.set(tools) {
                    self.emitter.emit(RegistryEvent::ToolsChanged {
                        definition_id: self.definition_id.clone(),
                        count,
                    });
                }
                self.prompts.set(prompts);
                self.set_cache_state(McpCacheState::Live);
            }
            Err(e) => {
                tracing::warn!(
                    server = %self.definition_id,
                    error = %e,
                    "Failed to refresh MCP capability lists"
                );
                let nonce = self
                    .registry
                    .server_definition(&self.collection_id, &self.definition_id)
                    .map(|d| d.cache_nonce());
                let fallback = refresh_fallback(
                    self.cache_state.get(),
                    self.cache
                        .get(&self.definition_id)
                        .map(|entry| Some(&entry.nonce) == nonce.as_ref()),
                );
                self.set_cache_state(fallback);
            }
        }
    }

    /// Run `f` against a running session, starting the server first when
    /// needed. The one funnel every capability object calls through.
    pub async fn call_on<T, F, Fut>(server: &Arc<Self>, f: F) -> Result<T, McpError>
    where
        F: FnOnce(Arc<McpSession>) -> Fut,
        Fut: std::future::Future<Output = Result<T, McpClientError>>,
    {
        let mut rx = server.connection_state.subscribe();
        let mut attempted = false;
        loop {
            let state = rx.borrow_and_update().clone();
            match state {
                ConnectionState::Running => {
                    if let Some(session) = server.session() {
                        return f(session).await.map_err(|e| classify_call_error(server, e));
                    }
                    // Session not yet installed; fall through to wait.
                }
                ConnectionState::Stopped | ConnectionState::Error(_) => {
                    if attempted {
                        return Err(McpError::ConnectionFailed {
                            server: server.label.clone(),
                            message: match state {
                                ConnectionState::Error(message) => message,
                                _ => "server did not start".to_string(),
                            },
                        });
                    }
                    attempted = true;
                    server.start(StartOptions::default()).await;
                    continue;
                }
                ConnectionState::Starting => {}
            }
            if rx.changed().await.is_err() {
                return Err(McpError::ConnectionFailed {
                    server: server.label.clone(),
                    message: "server disposed".to_string(),
                });
            }
        }
    }

    /// Call a tool by its server-side name. Progress-bearing calls retry
    /// once when the transport drops mid-call.
    pub async fn call_tool(
        self: &Arc<Self>,
        name: &str,
        arguments: Value,
        progress: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<McpToolResult, McpError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let name = name.to_string();
            let arguments = arguments.clone();
            let call_progress = progress.clone();
            let result = Self::call_on(self, move |session| async move {
                session.call_tool(&name, arguments, call_progress).await
            })
            .await;

            match result {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let retryable = matches!(e, McpError::ConnectionFailed { .. });
                    if attempts == 1 && progress.is_some() && retryable {
                        tracing::debug!(
                            server = %self.definition_id,
                            "Retrying tool call after connection loss"
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn report_start_failure(&self, message: &str, missing_binary: bool, interactive: bool) {
        self.emitter.emit(RegistryEvent::ServerError {
            definition_id: self.definition_id.clone(),
            label: self.label.clone(),
            error: message.to_string(),
        });
        if interactive {
            self.show_interactive_error(message, missing_binary);
        } else {
            tracing::warn!(server = %self.definition_id, error = %message, "MCP server failed to start");
        }
    }

    /// User-facing failure triage for interactive starts.
    fn show_interactive_error(&self, message: &str, missing_binary: bool) {
        let command = self
            .registry
            .server_definition(&self.collection_id, &self.definition_id)
            .and_then(|d| match d.launch {
                McpServerLaunch::Stdio { command, .. } => Some(command),
                McpServerLaunch::Http { .. } => None,
            });

        if missing_binary {
            if let Some(remediation) = command.as_deref().and_then(runtime_install_hint) {
                self.notifier.notify(
                    Severity::Error,
                    &format!(
                        "MCP server '{}' needs '{}', which is not installed.",
                        self.label,
                        command.as_deref().unwrap_or_default()
                    ),
                    Some(remediation),
                );
                return;
            }
        }

        if message.contains("debugpy") {
            self.notifier.notify(
                Severity::Error,
                &format!(
                    "MCP server '{}' could not attach debugpy. Set 'dev.debug.debugpyPath' to the debugpy executable.",
                    self.label
                ),
                None,
            );
            return;
        }

        self.notifier.notify(
            Severity::Warning,
            &format!("MCP server '{}' failed to start: {message}", self.label),
            Some(Remediation::ShowOutput),
        );
    }
}

/// Install-docs hint for the well-known package runners.
fn runtime_install_hint(command: &str) -> Option<Remediation> {
    let (label, url) = match command {
        "npx" => ("Install Node.js", "https://nodejs.org/en/download"),
        "uvx" => (
            "Install uv",
            "https://docs.astral.sh/uv/getting-started/installation/",
        ),
        "dnx" => ("Install .NET", "https://dotnet.microsoft.com/download"),
        _ => return None,
    };
    Some(Remediation::OpenUrl {
        label: label.to_string(),
        url: url.to_string(),
    })
}

/// Cache state after a failed refresh. Cached data is never discarded:
/// a from-cached refresh falls back to `Cached`/`Outdated` depending on
/// whether the snapshot still matches the definition.
fn refresh_fallback(current: McpCacheState, nonce_matches: Option<bool>) -> McpCacheState {
    match (current, nonce_matches) {
        (McpCacheState::RefreshingFromCached | McpCacheState::RefreshingFromUnknown, Some(true)) => {
            McpCacheState::Cached
        }
        (McpCacheState::RefreshingFromCached | McpCacheState::RefreshingFromUnknown, Some(false)) => {
            McpCacheState::Outdated
        }
        (McpCacheState::RefreshingFromCached, None) => McpCacheState::Outdated,
        (McpCacheState::RefreshingFromUnknown, None) => McpCacheState::Unknown,
        (other, _) => other,
    }
}

/// Normalize published tools: names restricted to `[a-z0-9_-]`, empty
/// descriptions replaced with a placeholder, structurally invalid input
/// schemas dropped. Returns the surviving tools and the dropped names.
fn normalize_tools(wire: Vec<WireTool>) -> (Vec<McpTool>, Vec<String>) {
    let mut tools = Vec::with_capacity(wire.len());
    let mut dropped = Vec::new();

    for tool in wire {
        if let Some(schema) = &tool.input_schema {
            if let Err(reason) = validate_input_schema(schema) {
                tracing::debug!(tool = %tool.name, reason = %reason, "Invalid tool input schema");
                dropped.push(tool.name);
                continue;
            }
        }
        let name = tool_name::sanitize(&tool.name);
        let description = match tool.description {
            Some(d) if !d.trim().is_empty() => d,
            _ => {
                tracing::warn!(tool = %name, "MCP tool has no description");
                "<empty>".to_string()
            }
        };
        let mut normalized = McpTool::new(name, description);
        normalized.input_schema = tool.input_schema;
        tools.push(normalized);
    }

    (tools, dropped)
}

const SCHEMA_TYPES: [&str; 7] = [
    "object", "array", "string", "number", "integer", "boolean", "null",
];

/// Structural draft-07 validation of a tool input schema: shape checks
/// only, no full keyword semantics.
fn validate_input_schema(schema: &Value) -> Result<(), String> {
    // Boolean schemas are valid draft-07.
    if schema.is_boolean() {
        return Ok(());
    }
    let Some(object) = schema.as_object() else {
        return Err("schema must be an object or boolean".to_string());
    };

    if let Some(kind) = object.get("type") {
        let valid = match kind {
            Value::String(s) => SCHEMA_TYPES.contains(&s.as_str()),
            Value::Array(kinds) => kinds.iter().all(|k| {
                k.as_str().is_some_and(|s| SCHEMA_TYPES.contains(&s))
            }),
            _ => false,
        };
        if !valid {
            return Err(format!("invalid 'type': {kind}"));
        }
    }

    if let Some(properties) = object.get("properties") {
        let Some(properties) = properties.as_object() else {
            return Err("'properties' must be an object".to_string());
        };
        for (name, sub) in properties {
            validate_input_schema(sub).map_err(|e| format!("property '{name}': {e}"))?;
        }
    }

    if let Some(required) = object.get("required") {
        let ok = required
            .as_array()
            .is_some_and(|names| names.iter().all(Value::is_string));
        if !ok {
            return Err("'required' must be an array of strings".to_string());
        }
    }

    if let Some(items) = object.get("items") {
        match items {
            Value::Array(subs) => {
                for sub in subs {
                    validate_input_schema(sub).map_err(|e| format!("items: {e}"))?;
                }
            }
            other => validate_input_schema(other).map_err(|e| format!("items: {e}"))?,
        }
    }

    for combinator in ["allOf", "anyOf", "oneOf"] {
        if let Some(subs) = object.get(combinator) {
            let Some(subs) = subs.as_array() else {
                return Err(format!("'{combinator}' must be an array"));
            };
            for sub in subs {
                validate_input_schema(sub).map_err(|e| format!("{combinator}: {e}"))?;
            }
        }
    }

    Ok(())
}

/// Map a session-level error to the registry taxonomy.
fn classify_call_error(server: &McpServer, error: McpClientError) -> McpError {
    if error.should_retry() {
        McpError::ConnectionFailed {
            server: server.label.clone(),
            message: error.to_string(),
        }
    } else {
        McpError::Tool(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcpd_core::domain::{McpCollection, McpServerDefinition};
    use mcpd_core::events::NoopEmitter;
    use mcpd_core::ports::{MemorySavedInputs, NoopNotifier, TrustPrompt};
    use serde_json::json;

    use crate::cache::McpMetadataCache;
    use mcpd_core::ports::MemoryStorage;

    #[test]
    fn test_normalize_sanitizes_names_and_descriptions() {
        let (tools, dropped) = normalize_tools(vec![
            WireTool {
                name: "Get Time!".to_string(),
                description: Some("Current time".to_string()),
                input_schema: None,
            },
            WireTool {
                name: "plain".to_string(),
                description: Some("  ".to_string()),
                input_schema: None,
            },
        ]);

        assert!(dropped.is_empty());
        assert_eq!(tools[0].name, "get_time_");
        assert_eq!(tools[0].description, "Current time");
        assert_eq!(tools[1].description, "<empty>");
    }

    #[test]
    fn test_normalize_drops_invalid_schemas() {
        let (tools, dropped) = normalize_tools(vec![
            WireTool {
                name: "good".to_string(),
                description: Some("ok".to_string()),
                input_schema: Some(json!({
                    "type": "object",
                    "properties": { "city": { "type": "string" } },
                    "required": ["city"]
                })),
            },
            WireTool {
                name: "bad".to_string(),
                description: Some("broken".to_string()),
                input_schema: Some(json!({ "type": "whatever" })),
            },
        ]);

        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "good");
        assert_eq!(dropped, vec!["bad".to_string()]);
    }

    #[test]
    fn test_schema_validation_recurses() {
        assert!(validate_input_schema(&json!(true)).is_ok());
        assert!(validate_input_schema(&json!({
            "type": "object",
            "properties": {
                "filters": {
                    "type": "array",
                    "items": { "type": ["string", "null"] }
                }
            }
        }))
        .is_ok());
        assert!(validate_input_schema(&json!({
            "properties": { "x": { "type": 42 } }
        }))
        .is_err());
        assert!(validate_input_schema(&json!({ "required": [1, 2] })).is_err());
        assert!(validate_input_schema(&json!("string")).is_err());
    }

    #[test]
    fn test_refresh_fallback_never_discards_cached() {
        assert_eq!(
            refresh_fallback(McpCacheState::RefreshingFromCached, Some(true)),
            McpCacheState::Cached
        );
        assert_eq!(
            refresh_fallback(McpCacheState::RefreshingFromCached, Some(false)),
            McpCacheState::Outdated
        );
        assert_eq!(
            refresh_fallback(McpCacheState::RefreshingFromUnknown, None),
            McpCacheState::Unknown
        );
        assert_eq!(
            refresh_fallback(McpCacheState::Live, Some(true)),
            McpCacheState::Live
        );
    }

    struct DenyAll;

    #[async_trait]
    impl TrustPrompt for DenyAll {
        async fn request_trust(
            &self,
            _id: &CollectionId,
            _label: &str,
        ) -> Option<bool> {
            Some(false)
        }
    }

    fn server_with(
        prompt: Arc<dyn TrustPrompt>,
        notifier: Arc<dyn UserNotifier>,
        command: &str,
    ) -> Arc<McpServer> {
        server_with_launch(
            prompt,
            notifier,
            McpServerLaunch::Stdio {
                command: command.to_string(),
                args: vec![],
                cwd: None,
                env: Default::default(),
                env_file: None,
            },
        )
    }

    fn server_with_launch(
        prompt: Arc<dyn TrustPrompt>,
        notifier: Arc<dyn UserNotifier>,
        launch: McpServerLaunch,
    ) -> Arc<McpServer> {
        let registry = McpCollectionRegistry::new(
            prompt,
            Arc::new(MemorySavedInputs::new()),
            Arc::new(NoopEmitter::new()),
        );
        let definition = McpServerDefinition::new("time", "Time", launch);
        // Held by the registry for the duration of the test via leak.
        std::mem::forget(
            registry.register_collection(
                McpCollection::new(CollectionId::new("c"), "C", vec![definition]),
                None,
            ),
        );
        McpServer::new(
            registry,
            Arc::new(McpMetadataCache::new(Arc::new(MemoryStorage::new()))),
            notifier,
            Arc::new(NoopEmitter::new()),
            HostCallbacks::default(),
            CollectionId::new("c"),
            "time".to_string(),
            "Time".to_string(),
        )
    }

    fn server_with_prompt(prompt: Arc<dyn TrustPrompt>) -> Arc<McpServer> {
        server_with(prompt, Arc::new(NoopNotifier::new()), "/nonexistent/mcp-server")
    }

    #[tokio::test]
    async fn test_trust_decline_is_a_normal_stop() {
        let server = server_with_prompt(Arc::new(DenyAll));
        let state = server.start(StartOptions::default()).await;
        assert_eq!(state, ConnectionState::Stopped);
        assert_eq!(server.connection_state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_successful_refresh_publishes_live_tools() {
        let fixture = crate::test_support::ScriptedServer::start().await;
        let server = server_with_launch(
            Arc::new(mcpd_core::ports::AlwaysTrust),
            Arc::new(NoopNotifier::new()),
            McpServerLaunch::Http {
                url: fixture.url.clone(),
                headers: vec![],
            },
        );

        let state = server.start(StartOptions::default()).await;
        assert_eq!(state, ConnectionState::Running);

        // The capability refresh runs in the background; wait for it to
        // land.
        let mut rx = server.subscribe_cache_state();
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while *rx.borrow_and_update() != McpCacheState::Live {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("capability refresh never went live");

        let tools = server.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "get_time");
        assert_eq!(fixture.count("tools/list"), 1);

        server.stop().await;
        assert_eq!(server.connection_state(), ConnectionState::Stopped);
    }

    #[tokio::test]
    async fn test_progress_tool_call_completes() {
        let fixture = crate::test_support::ScriptedServer::start().await;
        let server = server_with_launch(
            Arc::new(mcpd_core::ports::AlwaysTrust),
            Arc::new(NoopNotifier::new()),
            McpServerLaunch::Http {
                url: fixture.url.clone(),
                headers: vec![],
            },
        );

        // Progress-bearing calls take the undeadlined request path.
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = server.call_tool("get_time", json!({}), Some(tx)).await;

        assert!(result.is_ok());
        assert_eq!(fixture.count("tools/call"), 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_becomes_error_state() {
        let server = server_with_prompt(Arc::new(mcpd_core::ports::AlwaysTrust));
        let state = server.start(StartOptions::default()).await;
        assert!(matches!(state, ConnectionState::Error(_)));
        assert!(matches!(
            server.connection_state(),
            ConnectionState::Error(_)
        ));
    }

    #[tokio::test]
    async fn test_call_on_fails_after_one_start_attempt() {
        let server = server_with_prompt(Arc::new(mcpd_core::ports::AlwaysTrust));
        let result =
            McpServer::call_on(&server, |_session| async { Ok::<_, McpClientError>(()) }).await;
        assert!(matches!(result, Err(McpError::ConnectionFailed { .. })));
    }

    #[derive(Default)]
    struct RecordingNotifier {
        notices: std::sync::Mutex<Vec<(Severity, String, Option<Remediation>)>>,
    }

    impl UserNotifier for RecordingNotifier {
        fn notify(&self, severity: Severity, message: &str, remediation: Option<Remediation>) {
            self.notices
                .lock()
                .unwrap()
                .push((severity, message.to_string(), remediation));
        }
    }

    #[test]
    fn test_missing_runner_notice_carries_install_hint() {
        let notifier = Arc::new(RecordingNotifier::default());
        let server = server_with(
            Arc::new(mcpd_core::ports::AlwaysTrust),
            notifier.clone(),
            "npx",
        );
        server.show_interactive_error("failed to spawn 'npx': os error 2", true);

        let notices = notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, Severity::Error);
        assert!(matches!(notices[0].2, Some(Remediation::OpenUrl { .. })));
    }

    #[test]
    fn test_failure_text_alone_is_not_a_missing_binary() {
        // The phrase "not found" inside a server message must not
        // trigger the install hint; only the spawn flag does.
        let notifier = Arc::new(RecordingNotifier::default());
        let server = server_with(
            Arc::new(mcpd_core::ports::AlwaysTrust),
            notifier.clone(),
            "npx",
        );
        server.show_interactive_error("config file not found", false);

        let notices = notifier.notices.lock().unwrap();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, Severity::Warning);
        assert_eq!(notices[0].2, Some(Remediation::ShowOutput));
    }

    #[test]
    fn test_runtime_install_hint_covers_known_runners() {
        assert!(runtime_install_hint("npx").is_some());
        assert!(runtime_install_hint("uvx").is_some());
        assert!(runtime_install_hint("dnx").is_some());
        assert!(runtime_install_hint("python").is_none());
    }
}
