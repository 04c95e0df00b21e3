//! Connection lifecycle and the live protocol session.
//!
//! A [`Connection`] is the live or pending transport to one server
//! definition. Once `Running` it owns an [`McpSession`], the RPC surface
//! used by every capability object. Host callbacks for sampling and
//! elicitation are wired here so server-initiated requests get answered.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use mcpd_core::domain::{
    ConnectionState, McpPrompt, McpResource, McpResourceTemplate, McpServerLaunch, McpToolResult,
    ServerCapabilities, ServerIdentity,
};
use mcpd_core::observable::ObservableValue;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc};

use crate::client::{ClientEvent, McpClient, McpClientError, ServerRequest};

/// Host callback for `sampling/createMessage` requests originating from
/// the server.
#[async_trait]
pub trait SamplingHandler: Send + Sync {
    async fn create_message(&self, params: Value) -> Result<Value, String>;
}

/// Host callback for `elicitation/create` (structured user input)
/// requests originating from the server.
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn elicit(&self, params: Value) -> Result<Value, String>;
}

/// Declines every server-initiated request.
#[derive(Debug, Default)]
pub struct DeclineAll;

#[async_trait]
impl SamplingHandler for DeclineAll {
    async fn create_message(&self, _params: Value) -> Result<Value, String> {
        Err("sampling is not available in this host".to_string())
    }
}

#[async_trait]
impl ElicitationHandler for DeclineAll {
    async fn elicit(&self, _params: Value) -> Result<Value, String> {
        Err("elicitation is not available in this host".to_string())
    }
}

/// Host callbacks supplied at start time.
#[derive(Clone)]
pub struct HostCallbacks {
    pub sampling: Arc<dyn SamplingHandler>,
    pub elicitation: Arc<dyn ElicitationHandler>,
}

impl Default for HostCallbacks {
    fn default() -> Self {
        let decline = Arc::new(DeclineAll);
        Self {
            sampling: decline.clone(),
            elicitation: decline,
        }
    }
}

/// Tool entry exactly as the server published it, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct WireTool {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ToolsPage {
    #[serde(default)]
    tools: Vec<WireTool>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PromptsPage {
    #[serde(default)]
    prompts: Vec<McpPrompt>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResourcesPage {
    #[serde(default)]
    resources: Vec<McpResource>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemplatesPage {
    #[serde(default, rename = "resourceTemplates")]
    resource_templates: Vec<McpResourceTemplate>,
    #[serde(default, rename = "nextCursor")]
    next_cursor: Option<String>,
}

type ProgressMap = Arc<std::sync::Mutex<HashMap<i64, mpsc::UnboundedSender<Value>>>>;

/// The active protocol session of a running connection.
pub struct McpSession {
    client: Arc<McpClient>,
    progress: ProgressMap,
}

impl McpSession {
    pub fn identity(&self) -> &ServerIdentity {
        self.client.identity()
    }

    pub fn capabilities(&self) -> ServerCapabilities {
        self.client.capabilities()
    }

    /// Full tool list, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<WireTool>, McpClientError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let page: ToolsPage =
                serde_json::from_value(self.client.request("tools/list", params).await?)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(tools),
            }
        }
    }

    /// Full prompt list, following pagination cursors.
    pub async fn list_prompts(&self) -> Result<Vec<McpPrompt>, McpClientError> {
        let mut prompts = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let page: PromptsPage =
                serde_json::from_value(self.client.request("prompts/list", params).await?)?;
            prompts.extend(page.prompts);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(prompts),
            }
        }
    }

    pub async fn list_resources(&self) -> Result<Vec<McpResource>, McpClientError> {
        let mut resources = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let page: ResourcesPage =
                serde_json::from_value(self.client.request("resources/list", params).await?)?;
            resources.extend(page.resources);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(resources),
            }
        }
    }

    pub async fn list_resource_templates(
        &self,
    ) -> Result<Vec<McpResourceTemplate>, McpClientError> {
        let mut templates = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let page: TemplatesPage = serde_json::from_value(
                self.client
                    .request("resources/templates/list", params)
                    .await?,
            )?;
            templates.extend(page.resource_templates);
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(templates),
            }
        }
    }

    /// Call a tool. When `progress` is supplied, a token is attached and
    /// `notifications/progress` payloads are forwarded to it for the
    /// duration of the call. Progress-reporting calls are not bound by
    /// the default response timeout; the progress stream is the
    /// liveness signal for those.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        progress: Option<mpsc::UnboundedSender<Value>>,
    ) -> Result<McpToolResult, McpClientError> {
        let mut params = json!({ "name": name, "arguments": arguments });
        let token = progress.as_ref().map(|sender| {
            let token = next_progress_token();
            if let Ok(mut map) = self.progress.lock() {
                map.insert(token, sender.clone());
            }
            params["_meta"] = json!({ "progressToken": token });
            token
        });

        let deadline = if token.is_some() {
            None
        } else {
            Some(crate::client::REQUEST_TIMEOUT)
        };
        let outcome = self
            .client
            .request_with_deadline("tools/call", Some(params), deadline)
            .await;

        if let Some(token) = token {
            if let Ok(mut map) = self.progress.lock() {
                map.remove(&token);
            }
        }

        let result = outcome?;
        let content = result.get("content").cloned().unwrap_or_else(|| json!([]));
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if is_error {
            let message = content
                .as_array()
                .and_then(|arr| arr.first())
                .and_then(|item| item.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            Ok(McpToolResult::error(message))
        } else {
            Ok(McpToolResult::success(content))
        }
    }

    pub async fn get_prompt(&self, name: &str, arguments: Value) -> Result<Value, McpClientError> {
        self.client
            .request(
                "prompts/get",
                Some(json!({ "name": name, "arguments": arguments })),
            )
            .await
    }

    /// `resources/read` for a server-side URI; returns the contents
    /// array.
    pub async fn read_resource(&self, uri: &str) -> Result<Value, McpClientError> {
        let result = self
            .client
            .request("resources/read", Some(json!({ "uri": uri })))
            .await?;
        Ok(result.get("contents").cloned().unwrap_or_else(|| json!([])))
    }

    pub async fn subscribe_resource(&self, uri: &str) -> Result<(), McpClientError> {
        self.client
            .request("resources/subscribe", Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// `completion/complete` for prompt/template argument completion.
    pub async fn complete(
        &self,
        reference: Value,
        argument: Value,
    ) -> Result<Value, McpClientError> {
        self.client
            .request(
                "completion/complete",
                Some(json!({ "ref": reference, "argument": argument })),
            )
            .await
    }
}

fn next_progress_token() -> i64 {
    use std::sync::atomic::{AtomicI64, Ordering};
    static NEXT: AtomicI64 = AtomicI64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// State shared between the connection handle and its event task.
struct ConnectionShared {
    state: ObservableValue<ConnectionState>,
    tools_generation: ObservableValue<u64>,
    prompts_generation: ObservableValue<u64>,
    resource_updates: broadcast::Sender<String>,
}

/// The live or pending transport to one server definition.
pub struct Connection {
    /// Definition this connection was resolved for.
    pub definition_id: String,
    /// Label for logs and notifications.
    pub label: String,
    launch: McpServerLaunch,
    roots: Vec<PathBuf>,
    shared: Arc<ConnectionShared>,
    session: std::sync::Mutex<Option<Arc<McpSession>>>,
    event_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Connection {
    /// Create an unstarted connection for the given launch.
    pub fn new(
        definition_id: String,
        label: String,
        launch: McpServerLaunch,
        roots: Vec<PathBuf>,
    ) -> Self {
        let (resource_updates, _) = broadcast::channel(64);
        Self {
            definition_id,
            label,
            launch,
            roots,
            shared: Arc::new(ConnectionShared {
                state: ObservableValue::new(ConnectionState::Stopped),
                tools_generation: ObservableValue::new(0),
                prompts_generation: ObservableValue::new(0),
                resource_updates,
            }),
            session: std::sync::Mutex::new(None),
            event_task: std::sync::Mutex::new(None),
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    /// Subscribe to state changes.
    pub fn subscribe_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Generation counter bumped on `tools/list_changed`.
    pub fn subscribe_tools_changed(&self) -> tokio::sync::watch::Receiver<u64> {
        self.shared.tools_generation.subscribe()
    }

    /// Generation counter bumped on `prompts/list_changed`.
    pub fn subscribe_prompts_changed(&self) -> tokio::sync::watch::Receiver<u64> {
        self.shared.prompts_generation.subscribe()
    }

    /// Subscribe to server-pushed resource-update URIs.
    pub fn subscribe_resource_updates(&self) -> broadcast::Receiver<String> {
        self.shared.resource_updates.subscribe()
    }

    /// The active session, present only while `Running`.
    pub fn session(&self) -> Option<Arc<McpSession>> {
        self.session.lock().ok().and_then(|s| s.clone())
    }

    /// Launch the transport and run the handshake. On success the state
    /// is `Running` and a session is available; on failure the state is
    /// `Error` and the error is returned for classification.
    pub async fn start(&self, callbacks: HostCallbacks) -> Result<(), McpClientError> {
        self.shared.state.set(ConnectionState::Starting);

        let client = match McpClient::connect(&self.launch, &self.roots).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                self.shared.state.set(ConnectionState::Error(e.to_string()));
                return Err(e);
            }
        };

        let session = Arc::new(McpSession {
            client: Arc::clone(&client),
            progress: Arc::new(std::sync::Mutex::new(HashMap::new())),
        });

        if let Some(events) = client.take_events() {
            let task = tokio::spawn(run_event_loop(
                events,
                Arc::clone(&client),
                Arc::clone(&session.progress),
                callbacks,
                Arc::clone(&self.shared),
            ));
            if let Ok(mut slot) = self.event_task.lock() {
                *slot = Some(task);
            }
        }

        if let Ok(mut slot) = self.session.lock() {
            *slot = Some(session);
        }
        self.shared.state.set(ConnectionState::Running);
        Ok(())
    }

    /// Stop the transport and drop the session. Idempotent.
    pub fn stop(&self) {
        if let Ok(mut slot) = self.event_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
        if let Ok(mut slot) = self.session.lock() {
            if let Some(session) = slot.take() {
                session.client.disconnect();
            }
        }
        self.shared.state.set(ConnectionState::Stopped);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Consume transport events until the channel closes: bump generation
/// counters for list-changed notifications, forward progress and
/// resource updates, and answer server-initiated requests through the
/// host callbacks.
async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    client: Arc<McpClient>,
    progress: ProgressMap,
    callbacks: HostCallbacks,
    shared: Arc<ConnectionShared>,
) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::Notification { method, params } => {
                handle_notification(&method, params, &progress, &shared);
            }
            ClientEvent::Request(request) => {
                let client = Arc::clone(&client);
                let callbacks = callbacks.clone();
                tokio::spawn(async move {
                    answer_server_request(&client, &callbacks, request).await;
                });
            }
            ClientEvent::Closed { reason } => {
                let message = reason;
                // A deliberate stop already set Stopped; only an
                // unexpected close becomes an error.
                shared.state.update(|state| match state {
                    ConnectionState::Stopped => false,
                    _ => {
                        *state = ConnectionState::Error(message.clone());
                        true
                    }
                });
                break;
            }
        }
    }
}

fn handle_notification(
    method: &str,
    params: Option<Value>,
    progress: &ProgressMap,
    shared: &ConnectionShared,
) {
    match method {
        "notifications/tools/list_changed" => {
            shared.tools_generation.update(|g| {
                *g += 1;
                true
            });
        }
        "notifications/prompts/list_changed" => {
            shared.prompts_generation.update(|g| {
                *g += 1;
                true
            });
        }
        "notifications/resources/updated" => {
            if let Some(uri) = params
                .as_ref()
                .and_then(|p| p.get("uri"))
                .and_then(Value::as_str)
            {
                let _ = shared.resource_updates.send(uri.to_string());
            }
        }
        "notifications/progress" => {
            let Some(params) = params else { return };
            let token = params
                .get("progressToken")
                .and_then(Value::as_i64)
                .unwrap_or(-1);
            if let Ok(map) = progress.lock() {
                if let Some(sender) = map.get(&token) {
                    let _ = sender.send(params);
                }
            }
        }
        other => {
            tracing::debug!(method = other, "Ignoring unhandled MCP notification");
        }
    }
}

async fn answer_server_request(
    client: &McpClient,
    callbacks: &HostCallbacks,
    request: ServerRequest,
) {
    let params = request.params.unwrap_or_else(|| json!({}));
    let result = match request.method.as_str() {
        "sampling/createMessage" => callbacks.sampling.create_message(params).await,
        "elicitation/create" => callbacks.elicitation.elicit(params).await,
        "ping" => Ok(json!({})),
        other => Err(format!("unsupported request method '{other}'")),
    };

    let reply = result.map_err(|message| (-32601i64, message));
    if let Err(e) = client.respond(request.id, reply).await {
        tracing::warn!(error = %e, "Failed to answer server-initiated request");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_tool_deserializes_camel_case_schema() {
        let tool: WireTool = serde_json::from_value(json!({
            "name": "get_time",
            "description": "Current time",
            "inputSchema": { "type": "object" }
        }))
        .unwrap();

        assert_eq!(tool.name, "get_time");
        assert_eq!(tool.input_schema, Some(json!({ "type": "object" })));
    }

    #[test]
    fn test_tools_page_without_cursor() {
        let page: ToolsPage = serde_json::from_value(json!({
            "tools": [{ "name": "a" }, { "name": "b" }]
        }))
        .unwrap();
        assert_eq!(page.tools.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_tools_list_changed_bumps_generation() {
        let (resource_updates, _) = broadcast::channel(4);
        let shared = ConnectionShared {
            state: ObservableValue::new(ConnectionState::Running),
            tools_generation: ObservableValue::new(0),
            prompts_generation: ObservableValue::new(0),
            resource_updates,
        };
        let progress: ProgressMap = Arc::new(std::sync::Mutex::new(HashMap::new()));

        handle_notification("notifications/tools/list_changed", None, &progress, &shared);
        handle_notification("notifications/tools/list_changed", None, &progress, &shared);

        assert_eq!(shared.tools_generation.get(), 2);
        assert_eq!(shared.prompts_generation.get(), 0);
    }

    #[tokio::test]
    async fn test_resource_update_forwarded_to_subscribers() {
        let (resource_updates, _) = broadcast::channel(4);
        let shared = ConnectionShared {
            state: ObservableValue::new(ConnectionState::Running),
            tools_generation: ObservableValue::new(0),
            prompts_generation: ObservableValue::new(0),
            resource_updates,
        };
        let mut rx = shared.resource_updates.subscribe();
        let progress: ProgressMap = Arc::new(std::sync::Mutex::new(HashMap::new()));

        handle_notification(
            "notifications/resources/updated",
            Some(json!({ "uri": "file:///tmp/a.txt" })),
            &progress,
            &shared,
        );

        assert_eq!(rx.recv().await.unwrap(), "file:///tmp/a.txt");
    }

    #[tokio::test]
    async fn test_progress_routed_by_token() {
        let (resource_updates, _) = broadcast::channel(4);
        let shared = ConnectionShared {
            state: ObservableValue::new(ConnectionState::Running),
            tools_generation: ObservableValue::new(0),
            prompts_generation: ObservableValue::new(0),
            resource_updates,
        };
        let progress: ProgressMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();
        progress.lock().unwrap().insert(7, tx);

        handle_notification(
            "notifications/progress",
            Some(json!({ "progressToken": 7, "progress": 50, "total": 100 })),
            &progress,
            &shared,
        );

        let payload = rx.recv().await.unwrap();
        assert_eq!(payload["progress"], 50);
    }
}
