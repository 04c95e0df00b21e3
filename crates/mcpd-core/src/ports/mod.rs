//! Port definitions (trait abstractions) for external systems.
//!
//! Ports define the interfaces that the registry core expects from the
//! host application. They contain no implementation details and use only
//! domain types.
//!
//! # Design Rules
//!
//! - No process/filesystem implementation details in signatures
//! - Traits are minimal and intent-based
//! - Every port ships a `Noop`/in-memory implementation for tests and
//!   headless contexts

pub mod error;
pub mod extension_host;
pub mod notifier;
pub mod storage;
pub mod tool_registry;
pub mod trust;

pub use error::McpError;
pub use extension_host::{CollectionLoader, ExtensionHost, NoopExtensionHost};
pub use notifier::{NoopNotifier, Remediation, Severity, UserNotifier};
pub use storage::{
    MemorySavedInputs, MemoryStorage, MetadataStorage, PersistedMetadata, SavedInputStore,
    StorageError,
};
pub use tool_registry::{RegisteredTool, ToolRegistry};
pub use trust::{AlwaysTrust, TrustPrompt};
