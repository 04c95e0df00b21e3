//! MCP server definitions: the static description of one server's launch
//! configuration inside a collection.

use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::collection::Presentation;

/// How an MCP server is launched or reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum McpServerLaunch {
    /// Local subprocess speaking JSON-RPC over stdio.
    Stdio {
        /// Executable name or path.
        command: String,
        /// Arguments passed to the executable.
        #[serde(default)]
        args: Vec<String>,
        /// Working directory for the process.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
        /// Environment variables. A `None` value removes the variable
        /// from the inherited environment.
        #[serde(default)]
        env: BTreeMap<String, Option<String>>,
        /// Optional dotenv-style file merged into the environment.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        env_file: Option<PathBuf>,
    },
    /// Remote server reached over HTTP(S), optionally streaming via SSE.
    Http {
        /// Endpoint URL.
        url: String,
        /// Extra request headers (ordered).
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
}

impl McpServerLaunch {
    /// Validate that required fields are present and well-formed.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Stdio { command, cwd, .. } => {
                if command.is_empty() {
                    return Err("stdio server command cannot be empty".to_string());
                }
                if let Some(dir) = cwd {
                    if !dir.as_os_str().is_empty() && !dir.is_absolute() {
                        return Err(format!(
                            "stdio server cwd must be absolute: {}",
                            dir.display()
                        ));
                    }
                }
                Ok(())
            }
            Self::Http { url, .. } => {
                if url.is_empty() {
                    return Err("http server url cannot be empty".to_string());
                }
                Ok(())
            }
        }
    }
}

/// Debugger configuration for a dev-mode server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DebugConfig {
    /// Node inspector protocol (`--inspect-brk`).
    Node {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    /// Python debugpy.
    Debugpy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        /// Explicit path to a debugpy installation.
        #[serde(
            default,
            rename = "debugpyPath",
            skip_serializing_if = "Option::is_none"
        )]
        debugpy_path: Option<PathBuf>,
    },
}

/// Per-server development-mode configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevModeConfig {
    /// Glob patterns, relative to the server's first root, whose changes
    /// trigger a restart.
    #[serde(default)]
    pub watch: Vec<String>,

    /// Debugger attach configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugConfig>,
}

/// One operational server inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerDefinition {
    /// Identifier, unique within the owning collection.
    pub id: String,

    /// User-facing label.
    pub label: String,

    /// Launch configuration.
    pub launch: McpServerLaunch,

    /// Workspace folders visible to the server.
    #[serde(default)]
    pub roots: Vec<PathBuf>,

    /// Development-mode configuration, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dev_mode: Option<DevModeConfig>,

    /// Origin and ordering for presentation.
    #[serde(default)]
    pub presentation: Presentation,
}

impl McpServerDefinition {
    /// Create a definition with only the required fields set.
    pub fn new(id: impl Into<String>, label: impl Into<String>, launch: McpServerLaunch) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            launch,
            roots: Vec::new(),
            dev_mode: None,
            presentation: Presentation::default(),
        }
    }

    /// Whether an existing connection to `other` can be kept for this
    /// definition. Label and presentation changes never require a
    /// restart; launch, roots, and dev-mode changes always do.
    pub fn connection_equal(&self, other: &Self) -> bool {
        self.launch == other.launch && self.roots == other.roots && self.dev_mode == other.dev_mode
    }

    /// Opaque nonce over the connection-relevant fields. Changes exactly
    /// when `connection_equal` would report a difference, and is stable
    /// across recomputation, so it is usable for cache invalidation.
    pub fn cache_nonce(&self) -> String {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.launch.hash(&mut hasher);
        self.roots.hash(&mut hasher);
        self.dev_mode.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }

    /// Set the workspace roots.
    #[must_use]
    pub fn with_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.roots = roots;
        self
    }

    /// Set the dev-mode configuration.
    #[must_use]
    pub fn with_dev_mode(mut self, dev_mode: DevModeConfig) -> Self {
        self.dev_mode = Some(dev_mode);
        self
    }
}
