//! Capability projections: the four capability kinds an MCP server may
//! expose, plus the advertised capability flags and server identity.

use serde::{Deserialize, Serialize};

/// Capability flags advertised by a server during initialization.
///
/// Stored as a compact bitmask; cached alongside tool/prompt snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerCapabilities(u8);

impl ServerCapabilities {
    pub const TOOLS: Self = Self(1);
    pub const PROMPTS: Self = Self(1 << 1);
    pub const RESOURCES: Self = Self(1 << 2);
    pub const COMPLETIONS: Self = Self(1 << 3);
    pub const TOOLS_LIST_CHANGED: Self = Self(1 << 4);
    pub const PROMPTS_LIST_CHANGED: Self = Self(1 << 5);
    pub const RESOURCES_SUBSCRIBE: Self = Self(1 << 6);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, flag: Self) -> bool {
        self.0 & flag.0 == flag.0
    }

    #[must_use]
    pub const fn with(self, flag: Self) -> Self {
        Self(self.0 | flag.0)
    }
}

/// Identity reported by a server in its `initialize` result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    /// Server-reported name.
    pub name: String,

    /// Server-reported version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Usage instructions for the host model, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Tool definition from `tools/list`, after normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    /// Tool name as published by the server (normalized to `[a-z0-9_-]`).
    pub name: String,

    /// Human-readable description. Never empty after normalization.
    pub description: String,

    /// JSON Schema (draft-07) for input parameters.
    #[serde(default, rename = "inputSchema", skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

impl McpTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: None,
        }
    }

    #[must_use]
    pub fn with_input_schema(mut self, schema: serde_json::Value) -> Self {
        self.input_schema = Some(schema);
        self
    }
}

/// Prompt definition from `prompts/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpPrompt {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Declared prompt arguments, kept as raw JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Value>,
}

/// Concrete resource from `resources/list` or a template expansion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResource {
    /// Server-side URI of the resource.
    pub uri: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Resource template from `resources/templates/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpResourceTemplate {
    /// RFC 6570 URI template.
    #[serde(rename = "uriTemplate")]
    pub uri_template: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Result of a tool call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolResult {
    /// Whether the call succeeded.
    pub success: bool,

    /// Content array returned by the server (if success).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,

    /// Error message (if failed).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl McpToolResult {
    #[must_use]
    pub const fn success(content: serde_json::Value) -> Self {
        Self {
            success: true,
            content: Some(content),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            content: None,
            error: Some(message.into()),
        }
    }
}
