//! Discovery adapters: every way server collections enter the registry.
//!
//! Each adapter registers collections with deterministic ids so that
//! recomputation after a change reproduces the same identity and the
//! service keeps unchanged connections alive.

pub mod config_file;
pub mod extension;
pub mod installed;
pub mod paths;

use std::collections::HashSet;

pub use config_file::{ConfigFileAdapter, ConfigFileSource};
pub use extension::{ExtensionContribution, ExtensionDiscovery};
pub use installed::{InstalledDiscovery, InstalledServer};

/// Gates discovery globally and per source id.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryConfig {
    /// Master switch; when false no adapter runs.
    pub disabled: bool,
    /// Source ids (e.g. `claude-desktop`, `windsurf`) that are switched
    /// off individually.
    pub disabled_sources: HashSet<String>,
}

impl DiscoveryConfig {
    pub fn enabled(&self, source_id: &str) -> bool {
        !self.disabled && !self.disabled_sources.contains(source_id)
    }
}
