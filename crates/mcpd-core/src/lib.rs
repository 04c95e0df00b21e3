//! Domain types, ports, and events for the mcpd MCP registry.
//!
//! This crate contains no process, filesystem, or network implementation
//! details. Infrastructure concerns are expressed as ports (trait
//! abstractions) that the `mcpd-registry` crate and host applications
//! implement.

pub mod domain;
pub mod events;
pub mod observable;
pub mod ports;

// Re-export commonly used types for convenience
pub use domain::{
    CachedServerList, CollectionId, CollectionScope, ConnectionState, DebugConfig, DevModeConfig,
    LazyCollectionState, McpCacheState, McpCollection, McpPrompt, McpResource, McpResourceTemplate,
    McpServerDefinition, McpServerLaunch, McpTool, McpToolResult, Presentation, ServerCapabilities,
    ServerIdentity, ServerMetadataEntry,
};
pub use events::{NoopEmitter, RegistryEvent, RegistryEventEmitter};
pub use observable::ObservableValue;
pub use ports::{
    AlwaysTrust, CollectionLoader, ExtensionHost, McpError, MemorySavedInputs, MemoryStorage,
    MetadataStorage, NoopExtensionHost, NoopNotifier, PersistedMetadata, RegisteredTool,
    Remediation, SavedInputStore, Severity, StorageError, ToolRegistry, TrustPrompt, UserNotifier,
};
