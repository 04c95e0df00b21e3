//! MCP JSON-RPC client for communicating with MCP servers.
//!
//! Implements JSON-RPC 2.0 over stdio (spawned subprocess) or HTTP(S).
//! Reference: <https://spec.modelcontextprotocol.io/>
//!
//! The stdio transport runs a reader task that routes responses back to
//! their callers and forwards server-pushed notifications and
//! server-initiated requests (sampling, elicitation) to the connection
//! layer. The HTTP transport correlates request/response inline.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use mcpd_core::domain::{McpServerLaunch, ServerCapabilities, ServerIdentity};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::time::timeout;

/// Per-request response timeout. Generous because `npx`/`uvx` runners
/// may download packages on first start.
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// MCP protocol revision this client speaks.
const PROTOCOL_VERSION: &str = "2025-03-26";

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpClientError {
    #[error("failed to spawn '{command}': {message}")]
    SpawnFailed {
        command: String,
        /// The executable itself was missing (ENOENT).
        not_found: bool,
        message: String,
    },

    #[error("failed to communicate with MCP server: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP transport error: {0}")]
    Http(String),

    #[error("MCP protocol error: {0}")]
    Protocol(String),

    #[error("timeout waiting for MCP server response")]
    Timeout,

    #[error("MCP server returned error: code={code}, message={message}")]
    ServerError { code: i64, message: String },

    #[error("server closed the connection")]
    Closed,

    #[error("server not connected")]
    NotConnected,
}

impl McpClientError {
    /// Whether an in-flight call may be retried once on a fresh
    /// connection.
    pub const fn should_retry(&self) -> bool {
        matches!(self, Self::Closed | Self::Io(_))
    }

    /// The launch command itself could not be found (ENOENT).
    pub const fn is_missing_binary(&self) -> bool {
        matches!(self, Self::SpawnFailed { not_found: true, .. })
    }
}

/// JSON-RPC 2.0 request envelope.
#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

/// JSON-RPC 2.0 error payload.
#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// A request initiated by the server (sampling, elicitation, roots).
#[derive(Debug)]
pub struct ServerRequest {
    pub id: Value,
    pub method: String,
    pub params: Option<Value>,
}

/// Events surfaced from the transport to the connection layer.
#[derive(Debug)]
pub enum ClientEvent {
    /// Server-pushed notification (`notifications/...`).
    Notification { method: String, params: Option<Value> },
    /// Server-initiated request awaiting a reply via [`McpClient::respond`].
    Request(ServerRequest),
    /// The transport closed; no further events follow.
    Closed { reason: String },
}

/// Raw `initialize` result.
#[derive(Debug, Clone, Deserialize)]
struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    protocol_version: String,
    #[serde(rename = "serverInfo")]
    server_info: RawServerInfo,
    #[serde(default)]
    capabilities: RawCapabilities,
    #[serde(default)]
    instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawServerInfo {
    name: String,
    #[serde(default)]
    version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RawCapabilities {
    #[serde(default)]
    tools: Option<ListChangedCapability>,
    #[serde(default)]
    prompts: Option<ListChangedCapability>,
    #[serde(default)]
    resources: Option<ResourcesCapability>,
    #[serde(default)]
    completions: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ListChangedCapability {
    #[serde(default, rename = "listChanged")]
    list_changed: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResourcesCapability {
    #[serde(default)]
    subscribe: Option<bool>,
}

impl RawCapabilities {
    fn to_mask(&self) -> ServerCapabilities {
        let mut mask = ServerCapabilities::empty();
        if let Some(tools) = &self.tools {
            mask = mask.with(ServerCapabilities::TOOLS);
            if tools.list_changed == Some(true) {
                mask = mask.with(ServerCapabilities::TOOLS_LIST_CHANGED);
            }
        }
        if let Some(prompts) = &self.prompts {
            mask = mask.with(ServerCapabilities::PROMPTS);
            if prompts.list_changed == Some(true) {
                mask = mask.with(ServerCapabilities::PROMPTS_LIST_CHANGED);
            }
        }
        if let Some(resources) = &self.resources {
            mask = mask.with(ServerCapabilities::RESOURCES);
            if resources.subscribe == Some(true) {
                mask = mask.with(ServerCapabilities::RESOURCES_SUBSCRIBE);
            }
        }
        if self.completions.is_some() {
            mask = mask.with(ServerCapabilities::COMPLETIONS);
        }
        mask
    }
}

type PendingMap = Arc<std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<Value, JsonRpcError>>>>>;

enum Transport {
    Stdio {
        stdin: Arc<Mutex<ChildStdin>>,
        child: std::sync::Mutex<Option<Child>>,
        reader: tokio::task::JoinHandle<()>,
    },
    Http {
        http: reqwest::Client,
        url: url::Url,
        headers: Vec<(String, String)>,
        /// `Mcp-Session-Id` assigned by the server on initialize.
        session_id: std::sync::Mutex<Option<String>>,
    },
}

/// Client for one MCP server session.
pub struct McpClient {
    transport: Transport,
    pending: PendingMap,
    next_id: AtomicU64,
    events: std::sync::Mutex<Option<mpsc::UnboundedReceiver<ClientEvent>>>,
    identity: ServerIdentity,
    capabilities: ServerCapabilities,
    protocol_version: String,
}

impl McpClient {
    /// Connect according to the launch configuration and run the
    /// initialize handshake.
    pub async fn connect(
        launch: &McpServerLaunch,
        roots: &[PathBuf],
    ) -> Result<Self, McpClientError> {
        match launch {
            McpServerLaunch::Stdio {
                command,
                args,
                cwd,
                env,
                env_file,
            } => Self::connect_stdio(command, args, cwd.as_deref(), env, env_file.as_deref(), roots).await,
            McpServerLaunch::Http { url, headers } => Self::connect_http(url, headers).await,
        }
    }

    /// Spawn a stdio server and initialize the session.
    pub async fn connect_stdio(
        command: &str,
        args: &[String],
        cwd: Option<&Path>,
        env: &BTreeMap<String, Option<String>>,
        env_file: Option<&Path>,
        roots: &[PathBuf],
    ) -> Result<Self, McpClientError> {
        let mut cmd = tokio::process::Command::new(command);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }

        // env file first so explicit entries win
        if let Some(file) = env_file {
            for (key, value) in read_env_file(file)? {
                cmd.env(key, value);
            }
        }
        for (key, value) in env {
            match value {
                Some(value) => {
                    cmd.env(key, value);
                }
                None => {
                    cmd.env_remove(key);
                }
            }
        }

        let mut child = cmd.spawn().map_err(|e| McpClientError::SpawnFailed {
            command: command.to_string(),
            not_found: e.kind() == std::io::ErrorKind::NotFound,
            message: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpClientError::SpawnFailed {
            command: command.to_string(),
            not_found: false,
            message: "failed to open stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpClientError::SpawnFailed {
            command: command.to_string(),
            not_found: false,
            message: "failed to open stdout".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            let label = command.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(server = %label, "stderr: {line}");
                }
            });
        }

        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(stdout, Arc::clone(&pending), events_tx));

        let mut client = Self {
            transport: Transport::Stdio {
                stdin: Arc::new(Mutex::new(stdin)),
                child: std::sync::Mutex::new(Some(child)),
                reader,
            },
            pending,
            next_id: AtomicU64::new(1),
            events: std::sync::Mutex::new(Some(events_rx)),
            identity: ServerIdentity::default(),
            capabilities: ServerCapabilities::empty(),
            protocol_version: String::new(),
        };

        client.initialize(roots).await?;
        Ok(client)
    }

    /// Connect to an HTTP(S) endpoint and initialize the session.
    pub async fn connect_http(
        endpoint: &str,
        headers: &[(String, String)],
    ) -> Result<Self, McpClientError> {
        let url = url::Url::parse(endpoint)
            .map_err(|e| McpClientError::Http(format!("invalid url '{endpoint}': {e}")))?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| McpClientError::Http(e.to_string()))?;

        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let mut client = Self {
            transport: Transport::Http {
                http,
                url,
                headers: headers.to_vec(),
                session_id: std::sync::Mutex::new(None),
            },
            pending: Arc::new(std::sync::Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(1),
            events: std::sync::Mutex::new(Some(events_rx)),
            identity: ServerIdentity::default(),
            capabilities: ServerCapabilities::empty(),
            protocol_version: String::new(),
        };

        client.initialize(&[]).await?;
        Ok(client)
    }

    async fn initialize(&mut self, roots: &[PathBuf]) -> Result<(), McpClientError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "clientInfo": {
                "name": "mcpd",
                "version": env!("CARGO_PKG_VERSION")
            },
            "capabilities": {
                "sampling": {},
                "elicitation": {},
                "roots": { "listChanged": false }
            }
        });

        let raw = self.request("initialize", Some(params)).await?;
        let result: InitializeResult = serde_json::from_value(raw)?;

        self.identity = ServerIdentity {
            name: result.server_info.name,
            version: result.server_info.version,
            instructions: result.instructions,
        };
        self.capabilities = result.capabilities.to_mask();
        self.protocol_version = result.protocol_version;

        self.notify("notifications/initialized", None).await?;

        if !roots.is_empty() {
            // Roots are pushed eagerly; servers that care will call
            // roots/list themselves.
            tracing::debug!(count = roots.len(), "workspace roots available to server");
        }

        Ok(())
    }

    /// Identity reported by the server during initialization.
    pub const fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    /// Capability flags advertised by the server.
    pub const fn capabilities(&self) -> ServerCapabilities {
        self.capabilities
    }

    /// Negotiated protocol revision.
    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    /// Take the transport event stream. Yields `None` after the first
    /// call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ClientEvent>> {
        self.events.lock().ok().and_then(|mut events| events.take())
    }

    /// Send a JSON-RPC request and await its result, subject to the
    /// default response timeout.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, McpClientError> {
        self.request_with_deadline(method, params, Some(REQUEST_TIMEOUT))
            .await
    }

    /// Send a JSON-RPC request with an explicit response deadline.
    /// `None` waits indefinitely; the call still fails when the
    /// transport closes. Used for progress-reporting tool calls, which
    /// legitimately run longer than any fixed timeout.
    pub async fn request_with_deadline(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Duration>,
    ) -> Result<Value, McpClientError> {
        match &self.transport {
            Transport::Stdio { stdin, .. } => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                let (tx, rx) = oneshot::channel();
                if let Ok(mut pending) = self.pending.lock() {
                    pending.insert(id, tx);
                }

                let request = JsonRpcRequest {
                    jsonrpc: "2.0",
                    id,
                    method,
                    params,
                };
                let line = serde_json::to_string(&request)? + "\n";
                {
                    let mut stdin = stdin.lock().await;
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.flush().await?;
                }

                let outcome = match deadline {
                    Some(limit) => match timeout(limit, rx).await {
                        Ok(outcome) => outcome,
                        Err(_) => {
                            if let Ok(mut pending) = self.pending.lock() {
                                pending.remove(&id);
                            }
                            return Err(McpClientError::Timeout);
                        }
                    },
                    None => rx.await,
                };
                match outcome {
                    Ok(Ok(result)) => Ok(result),
                    Ok(Err(e)) => Err(McpClientError::ServerError {
                        code: e.code,
                        message: e.message,
                    }),
                    // Reader dropped the sender: transport closed.
                    Err(_) => Err(McpClientError::Closed),
                }
            }
            Transport::Http { .. } => self.http_round_trip(method, params, deadline, true).await,
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpClientError> {
        match &self.transport {
            Transport::Stdio { stdin, .. } => {
                let notification = json!({
                    "jsonrpc": "2.0",
                    "method": method,
                    "params": params.unwrap_or_else(|| json!({}))
                });
                let line = serde_json::to_string(&notification)? + "\n";
                let mut stdin = stdin.lock().await;
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await?;
                Ok(())
            }
            Transport::Http { .. } => self
                .http_round_trip(method, params, Some(REQUEST_TIMEOUT), false)
                .await
                .map(|_| ()),
        }
    }

    /// Reply to a server-initiated request.
    pub async fn respond(
        &self,
        id: Value,
        result: Result<Value, (i64, String)>,
    ) -> Result<(), McpClientError> {
        let message = match result {
            Ok(value) => json!({ "jsonrpc": "2.0", "id": id, "result": value }),
            Err((code, text)) => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": code, "message": text }
            }),
        };
        match &self.transport {
            Transport::Stdio { stdin, .. } => {
                let line = serde_json::to_string(&message)? + "\n";
                let mut stdin = stdin.lock().await;
                stdin.write_all(line.as_bytes()).await?;
                stdin.flush().await?;
                Ok(())
            }
            // Server-initiated requests only arrive on stdio transports.
            Transport::Http { .. } => Err(McpClientError::Protocol(
                "cannot respond over the HTTP transport".to_string(),
            )),
        }
    }

    async fn http_round_trip(
        &self,
        method: &str,
        params: Option<Value>,
        deadline: Option<Duration>,
        expects_result: bool,
    ) -> Result<Value, McpClientError> {
        let Transport::Http {
            http,
            url,
            headers,
            session_id,
        } = &self.transport
        else {
            return Err(McpClientError::NotConnected);
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let body = if expects_result {
            json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params })
        } else {
            json!({ "jsonrpc": "2.0", "method": method, "params": params.unwrap_or_else(|| json!({})) })
        };

        let mut request = http
            .post(url.clone())
            .header("Accept", "application/json, text/event-stream")
            .json(&body);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(session) = session_id.lock().ok().and_then(|s| s.clone()) {
            request = request.header("Mcp-Session-Id", session);
        }

        let send = request.send();
        let response = match deadline {
            Some(limit) => timeout(limit, send)
                .await
                .map_err(|_| McpClientError::Timeout)?,
            None => send.await,
        }
        .map_err(|e| McpClientError::Http(e.to_string()))?;

        if !response.status().is_success() {
            return Err(McpClientError::Http(format!(
                "server returned HTTP {}",
                response.status()
            )));
        }

        if let Some(session) = response
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(mut slot) = session_id.lock() {
                *slot = Some(session.to_string());
            }
        }

        if !expects_result {
            return Ok(Value::Null);
        }

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let text = response
            .text()
            .await
            .map_err(|e| McpClientError::Http(e.to_string()))?;

        let payload = if content_type.starts_with("text/event-stream") {
            // Take the first data frame carrying our response.
            text.lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim)
                .find(|data| !data.is_empty())
                .ok_or_else(|| McpClientError::Protocol("empty SSE response".to_string()))?
                .to_string()
        } else {
            text
        };

        let value: Value = serde_json::from_str(&payload)?;
        if let Some(error) = value.get("error") {
            let error: JsonRpcError = serde_json::from_value(error.clone())?;
            return Err(McpClientError::ServerError {
                code: error.code,
                message: error.message,
            });
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| McpClientError::Protocol("missing result in response".to_string()))
    }

    /// Tear down the transport. Safe to call more than once.
    pub fn disconnect(&self) {
        if let Transport::Stdio { child, reader, .. } = &self.transport {
            reader.abort();
            if let Ok(mut slot) = child.lock() {
                if let Some(mut child) = slot.take() {
                    // Reap in the background; kill_on_drop covers the rest.
                    tokio::spawn(async move {
                        let _ = child.kill().await;
                    });
                }
            }
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Route stdout lines: responses to their pending callers, notifications
/// and server-initiated requests to the event stream.
async fn read_loop(
    stdout: tokio::process::ChildStdout,
    pending: PendingMap,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let Ok(message) = serde_json::from_str::<Value>(trimmed) else {
                    // Package runners print banners on startup; skip them.
                    tracing::debug!(line = trimmed, "skipping non-JSON-RPC output");
                    continue;
                };
                route_message(message, &pending, &events);
            }
            Ok(None) => {
                fail_pending(&pending);
                let _ = events.send(ClientEvent::Closed {
                    reason: "server closed stdout".to_string(),
                });
                return;
            }
            Err(e) => {
                fail_pending(&pending);
                let _ = events.send(ClientEvent::Closed {
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

fn route_message(message: Value, pending: &PendingMap, events: &mpsc::UnboundedSender<ClientEvent>) {
    let has_id = message.get("id").is_some_and(|id| !id.is_null());
    let method = message.get("method").and_then(Value::as_str);

    match (has_id, method) {
        // Response to one of our requests
        (true, None) => {
            let Some(id) = message.get("id").and_then(Value::as_u64) else {
                return;
            };
            let Some(tx) = pending.lock().ok().and_then(|mut p| p.remove(&id)) else {
                return;
            };
            let outcome = if let Some(error) = message.get("error") {
                match serde_json::from_value::<JsonRpcError>(error.clone()) {
                    Ok(e) => Err(e),
                    Err(_) => Err(JsonRpcError {
                        code: -32_603,
                        message: "malformed error object".to_string(),
                    }),
                }
            } else {
                Ok(message.get("result").cloned().unwrap_or(Value::Null))
            };
            let _ = tx.send(outcome);
        }
        // Server-initiated request
        (true, Some(method)) => {
            let _ = events.send(ClientEvent::Request(ServerRequest {
                id: message.get("id").cloned().unwrap_or(Value::Null),
                method: method.to_string(),
                params: message.get("params").cloned(),
            }));
        }
        // Notification
        (false, Some(method)) => {
            let _ = events.send(ClientEvent::Notification {
                method: method.to_string(),
                params: message.get("params").cloned(),
            });
        }
        (false, None) => {}
    }
}

fn fail_pending(pending: &PendingMap) {
    if let Ok(mut pending) = pending.lock() {
        // Dropping the senders resolves every waiter with Closed.
        pending.clear();
    }
}

/// Load a dotenv-style file into key/value pairs without touching the
/// process environment.
fn read_env_file(path: &Path) -> Result<Vec<(String, String)>, McpClientError> {
    let mut pairs = Vec::new();
    for entry in dotenvy::from_path_iter(path).map_err(env_file_error)? {
        pairs.push(entry.map_err(env_file_error)?);
    }
    Ok(pairs)
}

fn env_file_error(e: dotenvy::Error) -> McpClientError {
    match e {
        dotenvy::Error::Io(io) => McpClientError::Io(io),
        other => McpClientError::Protocol(format!("invalid env file: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization_omits_empty_params() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: 1,
            method: "tools/list",
            params: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"method\":\"tools/list\""));
        assert!(!json.contains("params"));
    }

    #[test]
    fn test_missing_binary_flag() {
        let missing = McpClientError::SpawnFailed {
            command: "npx".to_string(),
            not_found: true,
            message: "No such file or directory".to_string(),
        };
        assert!(missing.is_missing_binary());

        let denied = McpClientError::SpawnFailed {
            command: "npx".to_string(),
            not_found: false,
            message: "permission denied".to_string(),
        };
        assert!(!denied.is_missing_binary());
        assert!(!McpClientError::Timeout.is_missing_binary());
    }

    #[test]
    fn test_capability_mask_mapping() {
        let raw: RawCapabilities = serde_json::from_value(json!({
            "tools": { "listChanged": true },
            "resources": { "subscribe": true }
        }))
        .unwrap();
        let mask = raw.to_mask();

        assert!(mask.contains(ServerCapabilities::TOOLS));
        assert!(mask.contains(ServerCapabilities::TOOLS_LIST_CHANGED));
        assert!(mask.contains(ServerCapabilities::RESOURCES));
        assert!(mask.contains(ServerCapabilities::RESOURCES_SUBSCRIBE));
        assert!(!mask.contains(ServerCapabilities::PROMPTS));
    }

    #[test]
    fn test_route_notification() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        route_message(
            json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" }),
            &pending,
            &tx,
        );

        match rx.try_recv().unwrap() {
            ClientEvent::Notification { method, .. } => {
                assert_eq!(method, "notifications/tools/list_changed");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_route_server_request() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel();

        route_message(
            json!({ "jsonrpc": "2.0", "id": 9, "method": "sampling/createMessage", "params": {} }),
            &pending,
            &tx,
        );

        match rx.try_recv().unwrap() {
            ClientEvent::Request(request) => {
                assert_eq!(request.method, "sampling/createMessage");
                assert_eq!(request.id, json!(9));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_route_response_resolves_pending() {
        let pending: PendingMap = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        let (sender, mut receiver) = oneshot::channel();
        pending.lock().unwrap().insert(3, sender);

        route_message(
            json!({ "jsonrpc": "2.0", "id": 3, "result": { "tools": [] } }),
            &pending,
            &tx,
        );

        let result = receiver.try_recv().unwrap().unwrap();
        assert_eq!(result, json!({ "tools": [] }));
    }

    #[test]
    fn test_read_env_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        std::fs::write(
            &path,
            "# comment\nKEY=value\nPORT=8080 # local override\nexport TOKEN=abc\nQUOTED=\"hi there\"\n",
        )
        .unwrap();

        let pairs = read_env_file(&path).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("KEY".to_string(), "value".to_string()),
                ("PORT".to_string(), "8080".to_string()),
                ("TOKEN".to_string(), "abc".to_string()),
                ("QUOTED".to_string(), "hi there".to_string()),
            ]
        );
    }

    #[test]
    fn test_read_env_file_missing() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_env_file(&dir.path().join("absent.env"));
        assert!(matches!(result, Err(McpClientError::Io(_))));
    }
}
