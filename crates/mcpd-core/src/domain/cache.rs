//! Cached capability metadata and the cache freshness state machine.

use serde::{Deserialize, Serialize};

use super::capability::{McpPrompt, McpTool, ServerCapabilities};
use super::definition::McpServerDefinition;

/// Freshness of a server's published capability data.
///
/// ```text
/// Unknown ──start──> RefreshingFromUnknown ──ok──> Live
/// Cached/Outdated ──start──> RefreshingFromCached ──ok──> Live
///                                  └──err──> Cached/Outdated (never Unknown)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum McpCacheState {
    /// No cache entry and never connected.
    #[default]
    Unknown,
    /// Cache entry present and its nonce matches the current definition.
    Cached,
    /// Cache entry present but the definition changed since it was taken.
    Outdated,
    /// Fetch in flight; stale-but-matching data is being shown meanwhile.
    RefreshingFromCached,
    /// Fetch in flight with nothing to show meanwhile.
    RefreshingFromUnknown,
    /// Data reflects the live connection with the current nonce.
    Live,
}

impl McpCacheState {
    /// Whether a background refresh is in flight.
    pub const fn is_refreshing(self) -> bool {
        matches!(self, Self::RefreshingFromCached | Self::RefreshingFromUnknown)
    }

    /// State to enter when a refresh begins from this state.
    #[must_use]
    pub const fn to_refreshing(self) -> Self {
        match self {
            Self::Unknown | Self::RefreshingFromUnknown => Self::RefreshingFromUnknown,
            _ => Self::RefreshingFromCached,
        }
    }
}

/// Last-known capability snapshot for one server definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMetadataEntry {
    /// When the snapshot was taken.
    #[serde(default = "chrono::Utc::now")]
    pub collected_at: chrono::DateTime<chrono::Utc>,

    /// Server-reported name at the time of the snapshot.
    pub server_name: String,

    /// Server-reported instructions, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_instructions: Option<String>,

    /// Nonce of the definition the snapshot was taken against.
    pub nonce: String,

    /// Published tools.
    #[serde(default)]
    pub tools: Vec<McpTool>,

    /// Published prompts.
    #[serde(default)]
    pub prompts: Vec<McpPrompt>,

    /// Advertised capability flags.
    #[serde(default)]
    pub capabilities: ServerCapabilities,
}

/// Cached definition list for a lazy collection, available before the
/// contributing extension activates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedServerList {
    /// Definitions as last observed.
    pub servers: Vec<McpServerDefinition>,

    /// Label of the contributing extension, for presentation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_label: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refreshing_transitions() {
        assert_eq!(
            McpCacheState::Unknown.to_refreshing(),
            McpCacheState::RefreshingFromUnknown
        );
        assert_eq!(
            McpCacheState::Cached.to_refreshing(),
            McpCacheState::RefreshingFromCached
        );
        assert_eq!(
            McpCacheState::Outdated.to_refreshing(),
            McpCacheState::RefreshingFromCached
        );
    }

    #[test]
    fn test_metadata_entry_roundtrip() {
        let entry = ServerMetadataEntry {
            collected_at: chrono::Utc::now(),
            server_name: "time".to_string(),
            server_instructions: None,
            nonce: "abc".to_string(),
            tools: vec![McpTool::new("get_time", "Get the time")],
            prompts: vec![],
            capabilities: ServerCapabilities::empty().with(ServerCapabilities::TOOLS),
        };
        let json = serde_json::to_string(&entry).unwrap();
        let back: ServerMetadataEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
