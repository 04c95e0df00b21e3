//! Read-only virtual filesystem over MCP resources.
//!
//! URIs have the form `mcp-resource://<hex-server-ref>/<scheme>/<authority>/<path>`:
//! the authority hex-encodes `collection-id/definition-id`, and the path
//! re-encodes the server-side resource URI so arbitrary schemes survive
//! the host's URI handling. Directories are synthesized from URI
//! prefixes; all mutation fails with a read-only error.

use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use mcpd_core::domain::CollectionId;
use mcpd_core::ports::McpError;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::server::McpServer;
use crate::service::McpService;

pub const SCHEME: &str = "mcp-resource";

/// A decoded `mcp-resource://` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUri {
    pub collection_id: CollectionId,
    pub definition_id: String,
    /// The server-side resource URI, e.g. `file:///logs/app.log`.
    pub resource_uri: String,
}

impl ResourceUri {
    /// Build the filesystem URI for a server-side resource.
    pub fn format(
        collection_id: &CollectionId,
        definition_id: &str,
        resource_uri: &str,
    ) -> Result<String, McpError> {
        let parsed = url::Url::parse(resource_uri)
            .map_err(|e| McpError::InvalidConfig(format!("invalid resource uri: {e}")))?;
        let authority = hex_encode(&format!("{collection_id}/{definition_id}"));
        let mut path = format!("/{}/{}", parsed.scheme(), parsed.authority());
        path.push_str(parsed.path());
        Ok(format!("{SCHEME}://{authority}{path}"))
    }

    /// Decode a filesystem URI back into its server reference and
    /// resource URI.
    pub fn parse(uri: &str) -> Result<Self, McpError> {
        let rest = uri
            .strip_prefix(&format!("{SCHEME}://"))
            .ok_or_else(|| McpError::InvalidConfig(format!("not an {SCHEME} uri: {uri}")))?;
        let (authority, path) = rest
            .split_once('/')
            .ok_or_else(|| McpError::InvalidConfig(format!("missing resource path: {uri}")))?;

        let server_ref = hex_decode(authority)
            .ok_or_else(|| McpError::InvalidConfig(format!("invalid server ref: {authority}")))?;
        let (collection_id, definition_id) = server_ref
            .split_once('/')
            .ok_or_else(|| McpError::InvalidConfig(format!("invalid server ref: {server_ref}")))?;

        let mut segments = path.splitn(3, '/');
        let scheme = segments
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| McpError::InvalidConfig(format!("missing resource scheme: {uri}")))?;
        let target_authority = segments.next().unwrap_or_default();
        let target_path = segments.next().unwrap_or_default();

        let resource_uri = if target_path.is_empty() {
            format!("{scheme}://{target_authority}")
        } else {
            format!("{scheme}://{target_authority}/{target_path}")
        };

        Ok(Self {
            collection_id: CollectionId::new(collection_id),
            definition_id: definition_id.to_string(),
            resource_uri,
        })
    }
}

fn hex_encode(text: &str) -> String {
    text.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(hex: &str) -> Option<String> {
    if hex.len() % 2 != 0 {
        return None;
    }
    let bytes: Option<Vec<u8>> = (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).ok())
        .collect();
    String::from_utf8(bytes?).ok()
}

/// Node metadata for `stat`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsNode {
    File { mime_type: Option<String> },
    Directory,
}

/// One entry from `read_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

/// The filesystem adapter; all operations route through the owning
/// server's session, starting it on demand.
pub struct McpResourceFs {
    service: Arc<McpService>,
}

impl McpResourceFs {
    pub fn new(service: Arc<McpService>) -> Self {
        Self { service }
    }

    async fn server(&self, uri: &ResourceUri) -> Result<Arc<McpServer>, McpError> {
        self.service
            .server(&uri.collection_id, &uri.definition_id)
            .await
            .ok_or_else(|| {
                McpError::NotFound(format!(
                    "no MCP server for '{}/{}'",
                    uri.collection_id, uri.definition_id
                ))
            })
    }

    /// Read a resource's contents. Issues exactly one `resources/read`
    /// with the decoded server-side URI.
    pub async fn read_file(&self, fs_uri: &str) -> Result<Vec<u8>, McpError> {
        let uri = ResourceUri::parse(fs_uri)?;
        let server = self.server(&uri).await?;
        let target = uri.resource_uri.clone();
        let contents =
            McpServer::call_on(&server, |session| async move {
                session.read_resource(&target).await
            })
            .await?;
        contents_to_bytes(&contents, &uri.resource_uri)
    }

    /// Stat a node: a listed resource is a file, a strict prefix of one
    /// is a synthesized directory.
    pub async fn stat(&self, fs_uri: &str) -> Result<FsNode, McpError> {
        let uri = ResourceUri::parse(fs_uri)?;
        let server = self.server(&uri).await?;
        let resources = McpServer::call_on(&server, |session| async move {
            session.list_resources().await
        })
        .await?;

        if let Some(resource) = resources.iter().find(|r| r.uri == uri.resource_uri) {
            return Ok(FsNode::File {
                mime_type: resource.mime_type.clone(),
            });
        }
        let prefix = dir_prefix(&uri.resource_uri);
        if resources.iter().any(|r| r.uri.starts_with(&prefix)) {
            return Ok(FsNode::Directory);
        }
        Err(McpError::NotFound(uri.resource_uri))
    }

    /// List the immediate children of a synthesized directory.
    pub async fn read_dir(&self, fs_uri: &str) -> Result<Vec<DirEntry>, McpError> {
        let uri = ResourceUri::parse(fs_uri)?;
        let server = self.server(&uri).await?;
        let resources = McpServer::call_on(&server, |session| async move {
            session.list_resources().await
        })
        .await?;

        let uris: Vec<&str> = resources.iter().map(|r| r.uri.as_str()).collect();
        Ok(synthesize_entries(&uri.resource_uri, &uris))
    }

    /// Subscribe to change notifications for one resource. The server
    /// must advertise `resources.subscribe`.
    pub async fn watch(&self, fs_uri: &str) -> Result<mpsc::UnboundedReceiver<()>, McpError> {
        let uri = ResourceUri::parse(fs_uri)?;
        let server = self.server(&uri).await?;
        let target = uri.resource_uri.clone();
        McpServer::call_on(&server, |session| async move {
            session.subscribe_resource(&target).await
        })
        .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let updates = server.subscribe_resource_updates().ok_or_else(|| {
            McpError::ConnectionFailed {
                server: uri.definition_id.clone(),
                message: "connection dropped before watch was established".to_string(),
            }
        })?;
        tokio::spawn(forward_updates(updates, uri.resource_uri, tx));
        Ok(rx)
    }

    /// All writes are rejected; MCP resources are a read-only surface.
    pub fn write_file(&self, fs_uri: &str) -> Result<(), McpError> {
        Err(McpError::ReadOnly(fs_uri.to_string()))
    }

    pub fn delete(&self, fs_uri: &str) -> Result<(), McpError> {
        Err(McpError::ReadOnly(fs_uri.to_string()))
    }

    pub fn create_dir(&self, fs_uri: &str) -> Result<(), McpError> {
        Err(McpError::ReadOnly(fs_uri.to_string()))
    }
}

/// Forward matching update URIs until the broadcast channel closes or
/// the watcher goes away. A lagged receiver cannot tell which updates
/// it missed, so the gap itself is reported as a change.
async fn forward_updates(
    mut updates: broadcast::Receiver<String>,
    watched: String,
    tx: mpsc::UnboundedSender<()>,
) {
    loop {
        match updates.recv().await {
            Ok(updated) => {
                if updated == watched && tx.send(()).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => {
                if tx.send(()).is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn dir_prefix(uri: &str) -> String {
    if uri.ends_with('/') {
        uri.to_string()
    } else {
        format!("{uri}/")
    }
}

/// Immediate children of `dir` given the flat resource URI list.
fn synthesize_entries(dir: &str, uris: &[&str]) -> Vec<DirEntry> {
    let prefix = dir_prefix(dir);
    let mut entries: Vec<DirEntry> = Vec::new();
    for uri in uris {
        let Some(remainder) = uri.strip_prefix(&prefix) else {
            continue;
        };
        if remainder.is_empty() {
            continue;
        }
        let (name, is_directory) = match remainder.split_once('/') {
            Some((head, _)) => (head, true),
            None => (remainder, false),
        };
        if let Some(existing) = entries.iter_mut().find(|e| e.name == name) {
            // A file and a deeper path under the same name: directory
            // wins.
            existing.is_directory |= is_directory;
        } else {
            entries.push(DirEntry {
                name: name.to_string(),
                is_directory,
            });
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    entries
}

/// Decode a `resources/read` contents array into raw bytes: inline text
/// as UTF-8, blobs as base64.
fn contents_to_bytes(contents: &Value, uri: &str) -> Result<Vec<u8>, McpError> {
    let item = contents
        .as_array()
        .and_then(|items| items.first())
        .ok_or_else(|| McpError::NotFound(uri.to_string()))?;

    if let Some(text) = item.get("text").and_then(Value::as_str) {
        return Ok(text.as_bytes().to_vec());
    }
    if let Some(blob) = item.get("blob").and_then(Value::as_str) {
        return BASE64
            .decode(blob)
            .map_err(|e| McpError::Protocol(format!("invalid blob for '{uri}': {e}")));
    }
    Err(McpError::Protocol(format!(
        "resource '{uri}' has neither text nor blob contents"
    )))
}
