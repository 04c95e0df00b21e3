//! MCP connection manager: discovery, lifecycle, capability caching.
//!
//! This crate binds the domain model from `mcpd-core` to real transports
//! and filesystems. The main entry points are:
//!
//! - [`registry::McpCollectionRegistry`] - owns the set of active
//!   collections and resolves definitions to connections
//! - [`server::McpServer`] - one server's lifecycle and capability data
//! - [`service::McpService`] - reconciles servers against collections and
//!   projects tools into the host registry
//! - [`discovery`] - adapters producing collections from config files,
//!   extensions, and the host's own server list

pub mod cache;
pub mod client;
pub mod connection;
pub mod devmode;
pub mod discovery;
pub mod registry;
pub mod resource_fs;
pub mod server;
pub mod service;
pub mod tool_name;
pub mod uri_template;

#[cfg(test)]
mod test_support;

pub use cache::McpMetadataCache;
pub use client::{McpClient, McpClientError, ServerRequest};
pub use connection::{
    Connection, ElicitationHandler, HostCallbacks, McpSession, SamplingHandler,
};
pub use devmode::DevModeAttacher;
pub use registry::{McpCollectionRegistry, RegistrationHandle, ResolveOptions, TransportFactory};
pub use resource_fs::{McpResourceFs, ResourceUri};
pub use server::{McpServer, StartOptions};
pub use service::McpService;
pub use uri_template::{TemplateValue, UriTemplate, UriTemplateError};
