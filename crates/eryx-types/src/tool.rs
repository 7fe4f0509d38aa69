//! Callback/tool descriptors shared between the registry and the
//! tool-server manager.

use serde::{Deserialize, Serialize};

/// Description of a host-side callable exposed to the guest by name.
///
/// This is the wire shape returned by `list_callbacks()` (spec §6) and
/// the shape the Tool-Server Manager produces for each proxied tool
/// (spec §4.12).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Unique callback name. May contain dots; `mcp.<server>.<tool>` is
    /// reserved for tool-server proxies.
    pub name: String,
    /// Human-readable description.
    pub description: String,
    /// JSON Schema describing the callback's arguments.
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    /// Build the reserved name for a tool-server proxy callback.
    pub fn mcp_name(server: &str, tool: &str) -> String {
        format!("mcp.{server}.{tool}")
    }

    /// Returns the `(server, tool)` pair if `name` follows the
    /// `mcp.<server>.<tool>` convention.
    pub fn split_mcp_name(name: &str) -> Option<(&str, &str)> {
        let rest = name.strip_prefix("mcp.")?;
        rest.split_once('.')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcp_name_round_trips() {
        let name = ToolDefinition::mcp_name("github", "create_issue");
        assert_eq!(name, "mcp.github.create_issue");
        assert_eq!(
            ToolDefinition::split_mcp_name(&name),
            Some(("github", "create_issue"))
        );
    }

    #[test]
    fn split_mcp_name_rejects_non_mcp() {
        assert_eq!(ToolDefinition::split_mcp_name("echo"), None);
    }

    #[test]
    fn split_mcp_name_handles_dotted_tool_names() {
        // Tool names may themselves contain dots; only the first two
        // segments are structural.
        assert_eq!(
            ToolDefinition::split_mcp_name("mcp.fs.read.file"),
            Some(("fs", "read.file"))
        );
    }
}
