//! Domain types for the MCP registry.
//!
//! These types describe collections, server definitions, capability
//! projections, and cached metadata. They are serde-stable where they
//! cross a persistence or wire boundary.

mod cache;
mod capability;
mod collection;
mod connection;
mod definition;

pub use cache::{CachedServerList, McpCacheState, ServerMetadataEntry};
pub use capability::{
    McpPrompt, McpResource, McpResourceTemplate, McpTool, McpToolResult, ServerCapabilities,
    ServerIdentity,
};
pub use collection::{
    CollectionId, CollectionScope, LazyCollectionState, McpCollection, Presentation,
};
pub use connection::ConnectionState;
pub use definition::{DebugConfig, DevModeConfig, McpServerDefinition, McpServerLaunch};
