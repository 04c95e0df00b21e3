//! Error taxonomy crossing the registry boundary.

use thiserror::Error;

/// Errors surfaced by registry operations.
///
/// Trust decline is deliberately absent: a user refusing trust is a
/// normal `Stopped` outcome, not an error.
#[derive(Debug, Error)]
pub enum McpError {
    /// Transport could not be established or died (spawn/network error).
    #[error("connection to MCP server '{server}' failed: {message}")]
    ConnectionFailed { server: String, message: String },

    /// JSON-RPC communication failure.
    #[error("MCP protocol error: {0}")]
    Protocol(String),

    /// Tool invocation failed server-side.
    #[error("MCP tool error: {0}")]
    Tool(String),

    /// Configuration is invalid (bad launch, unknown debug type, ...).
    #[error("invalid MCP configuration: {0}")]
    InvalidConfig(String),

    /// Debugger attach failed before the server was launched.
    #[error("debug attach failed: {0}")]
    DebugAttach(String),

    /// Write attempted against the read-only resource filesystem.
    #[error("MCP resources are read-only: {0}")]
    ReadOnly(String),

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal invariant failure.
    #[error("internal MCP error: {0}")]
    Internal(String),
}
