//! Extension host port for lazy (extension-contributed) collections.

use async_trait::async_trait;

use crate::domain::McpServerDefinition;

/// Activates extensions on demand.
///
/// A lazy collection's load path fires a per-collection activation event
/// (`onMcpCollection:<id>`) through this port and then waits for
/// transport delegates to publish their initial providers.
#[async_trait]
pub trait ExtensionHost: Send + Sync {
    /// Fire an activation event and wait for the matching extensions to
    /// finish activating.
    async fn activate(&self, activation_event: &str) -> Result<(), String>;
}

/// Extension host that activates nothing; for tests and hosts without an
/// extension system.
#[derive(Debug, Default)]
pub struct NoopExtensionHost;

#[async_trait]
impl ExtensionHost for NoopExtensionHost {
    async fn activate(&self, _activation_event: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Resolves the real definition list of a lazy collection.
///
/// `load` is invoked at most once per registration; `removed` fires when
/// the underlying contribution disappears before a load completed.
#[async_trait]
pub trait CollectionLoader: Send + Sync {
    async fn load(&self) -> Result<Vec<McpServerDefinition>, String>;

    async fn removed(&self) {}
}
