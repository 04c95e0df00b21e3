//! Collections: named sources of server definitions.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::definition::McpServerDefinition;
use crate::observable::ObservableValue;

/// Globally unique collection identifier, namespaced by discovery source
/// (`extension.<id>`, `mcp.config.<file-id>`, `cursor-workspace.<index>`, ...).
///
/// Id generation must be deterministic and stable across recomputation so
/// that unchanged collections are recognized as "the same" by
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionId(String);

impl CollectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Id for an extension-contributed collection.
    pub fn for_extension(extension_id: &str) -> Self {
        Self(format!("extension.{extension_id}"))
    }

    /// Id for a collection backed by a discovered config file. The file
    /// id is a stable slug of the path, not the path itself, so moving a
    /// workspace does not resurrect stale collections.
    pub fn for_config_file(file_id: &str) -> Self {
        Self(format!("mcp.config.{file_id}"))
    }

    /// Id for a per-workspace-folder Cursor collection.
    pub fn for_cursor_workspace(folder_index: usize) -> Self {
        Self(format!("cursor-workspace.{folder_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CollectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where a collection's definitions live and where edits are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionScope {
    /// Applies to the user profile, independent of the open workspace.
    #[default]
    Profile,
    /// Applies to the current workspace only.
    Workspace,
}

/// Origin file and sort order for presentation purposes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Presentation {
    /// File the entry originates from, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<PathBuf>,

    /// Sort order among siblings.
    #[serde(default)]
    pub order: i32,
}

/// State of a lazily-loaded collection (definitions unknown until an
/// extension activates). The loader itself is held registry-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyCollectionState {
    /// Whether the current definition list came from the metadata cache
    /// rather than a completed load.
    pub is_cached: bool,
}

/// A named source of zero or more server definitions.
///
/// Created by a discovery adapter when its underlying source appears and
/// disposed when it disappears; definitions mutate in place through the
/// observable `servers` list.
#[derive(Debug)]
pub struct McpCollection {
    /// Globally unique id (see [`CollectionId`]).
    pub id: CollectionId,

    /// User-facing label.
    pub label: String,

    /// Profile or workspace scope.
    pub scope: CollectionScope,

    /// File that edits to this collection are written back to.
    pub config_target: Option<PathBuf>,

    /// Remote authority for collections living on a remote host;
    /// `None` for local collections.
    pub remote_authority: Option<String>,

    /// Whether servers from this collection may start without prompting.
    pub trusted_by_default: bool,

    /// Origin + sort order.
    pub presentation: Presentation,

    /// The live definition list.
    pub servers: ObservableValue<Vec<McpServerDefinition>>,

    /// Present iff the definition list is resolved lazily.
    pub lazy: Option<LazyCollectionState>,
}

impl McpCollection {
    /// Create an eagerly-populated collection.
    pub fn new(
        id: CollectionId,
        label: impl Into<String>,
        servers: Vec<McpServerDefinition>,
    ) -> Self {
        Self {
            id,
            label: label.into(),
            scope: CollectionScope::Profile,
            config_target: None,
            remote_authority: None,
            trusted_by_default: false,
            presentation: Presentation::default(),
            servers: ObservableValue::new(servers),
            lazy: None,
        }
    }

    /// Mark the collection as lazily loaded.
    #[must_use]
    pub fn with_lazy(mut self, is_cached: bool) -> Self {
        self.lazy = Some(LazyCollectionState { is_cached });
        self
    }

    /// Set the scope.
    #[must_use]
    pub const fn with_scope(mut self, scope: CollectionScope) -> Self {
        self.scope = scope;
        self
    }

    /// Mark the collection as trusted without prompting.
    #[must_use]
    pub const fn trusted(mut self) -> Self {
        self.trusted_by_default = true;
        self
    }

    /// Set the origin file used both for presentation and as the edit
    /// target.
    #[must_use]
    pub fn with_origin(mut self, origin: PathBuf) -> Self {
        self.config_target = Some(origin.clone());
        self.presentation.origin = Some(origin);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collection_id_namespacing() {
        assert_eq!(
            CollectionId::for_extension("vendor.tools").as_str(),
            "extension.vendor.tools"
        );
        assert_eq!(
            CollectionId::for_cursor_workspace(2).as_str(),
            "cursor-workspace.2"
        );
        assert_eq!(
            CollectionId::for_config_file("ab12").as_str(),
            "mcp.config.ab12"
        );
    }

    #[test]
    fn test_collection_defaults() {
        let collection = McpCollection::new(CollectionId::new("test"), "Test", vec![]);
        assert_eq!(collection.scope, CollectionScope::Profile);
        assert!(!collection.trusted_by_default);
        assert!(collection.lazy.is_none());
        assert!(collection.servers.get().is_empty());
    }
}
