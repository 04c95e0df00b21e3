//! Native config file locations for the well-known MCP hosts.
//!
//! Uses platform conventions via `dirs`; workspace-relative locations
//! take the workspace folder as input.

use std::path::{Path, PathBuf};

/// `claude_desktop_config.json` in the platform config directory.
///
/// macOS: `~/Library/Application Support/Claude/`, Linux:
/// `~/.config/Claude/`, Windows: `%APPDATA%\Claude\`.
pub fn claude_desktop_config() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("Claude").join("claude_desktop_config.json"))
}

/// Cursor's user-level `~/.cursor/mcp.json`.
pub fn cursor_user_config() -> Option<PathBuf> {
    dirs::home_dir().map(|dir| dir.join(".cursor").join("mcp.json"))
}

/// Cursor's per-workspace `.cursor/mcp.json`.
pub fn cursor_workspace_config(workspace_folder: &Path) -> PathBuf {
    workspace_folder.join(".cursor").join("mcp.json")
}

/// Windsurf's `~/.codeium/windsurf/mcp_config.json`.
pub fn windsurf_config() -> Option<PathBuf> {
    dirs::home_dir().map(|dir| {
        dir.join(".codeium")
            .join("windsurf")
            .join("mcp_config.json")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_config_is_relative_to_folder() {
        let path = cursor_workspace_config(Path::new("/work/project"));
        assert_eq!(path, PathBuf::from("/work/project/.cursor/mcp.json"));
    }

    #[test]
    fn test_global_paths_have_expected_suffixes() {
        if let Some(path) = claude_desktop_config() {
            assert!(path.ends_with("Claude/claude_desktop_config.json"));
        }
        if let Some(path) = cursor_user_config() {
            assert!(path.ends_with(".cursor/mcp.json"));
        }
        if let Some(path) = windsurf_config() {
            assert!(path.ends_with(".codeium/windsurf/mcp_config.json"));
        }
    }
}
