//! Tool catalog model shared by the internal and unified managers.

pub mod builtin;
pub mod internal;
pub mod provider;
pub mod unified;

use serde_json::Value;

/// Prefix identifying process-local tools in the unified namespace.
pub const INTERNAL_PREFIX: &str = "cipher_";

/// Separator between a server name and its tool in the external namespace.
pub const EXTERNAL_SEPARATOR: char = '/';

/// Where a catalog entry comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolSource {
    Internal,
    External { server: String },
}

/// One entry in the unified catalog.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON schema for the tool's arguments.
    pub parameters: Value,
    pub source: ToolSource,
    /// Whether agents may call this tool (internal tools only; external
    /// tools are always agent-accessible).
    pub agent_accessible: bool,
    pub category: Option<String>,
    /// Requires the embedding subsystem; hidden when embeddings are disabled.
    pub requires_embeddings: bool,
}

/// Apply the internal prefix unless already present.
pub fn normalize_internal_name(name: &str) -> String {
    if name.starts_with(INTERNAL_PREFIX) {
        name.to_string()
    } else {
        format!("{INTERNAL_PREFIX}{name}")
    }
}

/// True when a unified name addresses an internal tool.
pub fn is_internal_name(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX)
}

/// Namespace an external tool under its server: `gh` + `list_repos`
/// becomes `gh/list_repos`.
pub fn namespace_external(server: &str, tool: &str) -> String {
    format!("{server}{EXTERNAL_SEPARATOR}{tool}")
}

/// Split a namespaced external name into (server, tool).
pub fn split_external(name: &str) -> Option<(&str, &str)> {
    name.split_once(EXTERNAL_SEPARATOR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_adds_prefix_once() {
        assert_eq!(normalize_internal_name("memory_search"), "cipher_memory_search");
        assert_eq!(
            normalize_internal_name("cipher_memory_search"),
            "cipher_memory_search"
        );
    }

    #[test]
    fn test_is_internal_name() {
        assert!(is_internal_name("cipher_memory_search"));
        assert!(!is_internal_name("gh/list_repos"));
        assert!(!is_internal_name("memory_search"));
    }

    #[test]
    fn test_namespace_roundtrip() {
        let namespaced = namespace_external("echo", "ping");
        assert_eq!(namespaced, "echo/ping");
        let (server, tool) = split_external(&namespaced).unwrap();
        assert_eq!(server, "echo");
        assert_eq!(tool, "ping");
    }

    #[test]
    fn test_split_external_no_separator() {
        assert!(split_external("ping").is_none());
    }

    #[test]
    fn test_split_external_keeps_tool_slashes() {
        // Only the first separator splits; the rest belongs to the tool name.
        let (server, tool) = split_external("fs/read/file").unwrap();
        assert_eq!(server, "fs");
        assert_eq!(tool, "read/file");
    }
}
