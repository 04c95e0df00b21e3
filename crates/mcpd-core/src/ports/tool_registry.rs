//! Host tool registry port.
//!
//! The service projects discovered tools into the host's tool registry;
//! this port is the write surface of that projection.

use serde::{Deserialize, Serialize};

use crate::domain::CollectionId;

/// A tool as registered with the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredTool {
    /// Host-wide unique tool id: `sanitize(prefix + name)`, truncated.
    pub id: String,

    /// Collection the owning server belongs to.
    pub collection_id: CollectionId,

    /// Definition id of the owning server.
    pub definition_id: String,

    /// Original tool name on the server.
    pub name: String,

    /// Description shown to the model/user.
    pub description: String,

    /// JSON Schema for input parameters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
}

/// Write surface of the host tool registry.
///
/// Implementations must tolerate `unregister` of unknown ids (deletions
/// are applied before insertions when a tool moves between servers).
pub trait ToolRegistry: Send + Sync {
    fn register(&self, tool: RegisteredTool);
    fn unregister(&self, id: &str);
}
