//! Tool id sanitization and collision-free prefix generation.
//!
//! Published tool ids are `sanitize(prefix + name)` truncated to a fixed
//! maximum; prefixes are derived per server label and de-duplicated per
//! reconciliation generation so tools from same-named servers never
//! collide.

use std::collections::HashSet;

/// Maximum length of a published tool id.
pub const MAX_TOOL_ID_LENGTH: usize = 64;

/// Maximum length of a generated prefix, leaving room for tool names.
const MAX_PREFIX_LENGTH: usize = 18;

/// Restrict a name to `[a-z0-9_-]`, replacing every other character with
/// an underscore.
pub fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build the published tool id from a server prefix and a tool name.
pub fn qualified_tool_id(prefix: &str, name: &str) -> String {
    let mut id = sanitize(&format!("{prefix}{name}"));
    id.truncate(MAX_TOOL_ID_LENGTH);
    id
}

/// Generates pairwise-distinct tool-name prefixes for one reconciliation
/// generation.
#[derive(Debug, Default)]
pub struct McpPrefixGenerator {
    seen: HashSet<String>,
}

impl McpPrefixGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefix for a server label: sanitized and truncated base, suffixed
    /// with an incrementing integer on collision. Always ends with `_`.
    pub fn prefix_for(&mut self, label: &str) -> String {
        let mut base = sanitize(label);
        base.truncate(MAX_PREFIX_LENGTH);
        let base = base.trim_matches('_').to_string();
        let base = if base.is_empty() {
            "mcp".to_string()
        } else {
            base
        };

        let mut candidate = format!("{base}_");
        let mut counter = 1;
        while !self.seen.insert(candidate.clone()) {
            counter += 1;
            candidate = format!("{base}{counter}_");
        }
        candidate
    }
}
