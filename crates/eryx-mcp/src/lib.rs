//! Tool-Server Manager: subprocess lifecycle, JSON-RPC client, and
//! callback-proxy registration for external MCP-style tool servers
//! (spec §4.12).
//!
//! A caller discovers one or more `StdioServerSpec`s (via
//! [`parse_server_table`]), hands each to a [`ToolServerManager`] to
//! spawn and connect, then registers the manager's discovered tools
//! into a `Sandbox`/`Session`'s callback set with [`register_mcp_tools`]
//! before the sandbox is built.

pub mod client;
pub mod config;
pub mod error;
pub mod manager;
pub mod proxy;

pub use client::McpClient;
pub use config::{interpolate_env, parse_server_table, StdioServerSpec, JSON_TABLE_KEYS, TOML_TABLE_KEY};
pub use error::{McpError, McpResult};
pub use manager::{ServerState, ToolServerManager};
pub use proxy::register_mcp_tools;
