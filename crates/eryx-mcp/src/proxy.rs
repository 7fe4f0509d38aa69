//! Wires discovered tool-server tools into a sandbox's Callback Registry
//! (spec §4.12: "callback proxy registration").
//!
//! Each MCP tool becomes one `eryx_runtime::Callback` whose handler
//! closes over the shared `ToolServerManager`, the owning server's name,
//! and the tool's *raw* (un-namespaced) name, and simply forwards to
//! `ToolServerManager::call_tool`. Grounded on the same capability-proxy
//! shape the teacher's `host_functions::dispatch` uses for its other
//! host-mediated calls, generalized to a dynamically discovered set.

use std::sync::Arc;

use eryx_runtime::{Callback, CallbackRegistryBuilder};
use eryx_types::ToolDefinition;

use crate::manager::ToolServerManager;

/// Register every tool currently known to `manager` (i.e. every server
/// that has reached `Ready`) into `builder`, as proxies keyed by their
/// namespaced `mcp.<server>.<tool>` name.
pub fn register_mcp_tools(builder: &mut CallbackRegistryBuilder, manager: Arc<ToolServerManager>, tools: Vec<ToolDefinition>) -> eryx_types::EryxResult<()> {
    for definition in tools {
        let (server, raw_tool) = match ToolDefinition::split_mcp_name(&definition.name) {
            Some(parts) => parts,
            None => continue,
        };
        let server = server.to_string();
        let raw_tool = raw_tool.to_string();
        let manager = manager.clone();
        builder.register(Callback::new(definition, move |args| {
            let manager = manager.clone();
            let server = server.clone();
            let raw_tool = raw_tool.clone();
            async move { manager.call_tool(&server, &raw_tool, args).await }
        }))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn unreachable_server_surfaces_as_callback_error() {
        let manager = Arc::new(ToolServerManager::default());
        let mut builder = CallbackRegistryBuilder::new();
        let tools = vec![ToolDefinition {
            name: ToolDefinition::mcp_name("github", "search_issues"),
            description: "search issues".into(),
            input_schema: json!({"type": "object"}),
        }];
        register_mcp_tools(&mut builder, manager, tools).unwrap();
        let registry = builder.freeze();
        let cb = registry.lookup("mcp.github.search_issues").expect("registered");
        let err = cb.call(json!({"q": "bug"})).await.unwrap_err();
        assert!(err.contains("unknown tool server"));
    }
}
