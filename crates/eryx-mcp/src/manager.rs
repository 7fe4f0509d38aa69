//! Tool-Server Manager — lifecycle and callback-proxy registration for
//! many named subprocess tool servers (spec §4.12).
//!
//! Generalizes the teacher's single `McpConnection` into a multiplexed
//! manager keyed by server name, mirroring `process_manager.rs`'s
//! `DashMap<ProcessId, ManagedProcess>` shape for concurrent lifecycle
//! bookkeeping. Per-server state machine (`Spawning → Initializing →
//! Ready → {Closing, Faulted} → Closed`) has no teacher counterpart —
//! added per spec §4.12.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use eryx_types::ToolDefinition;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::client::McpClient;
use crate::config::StdioServerSpec;
use crate::error::{McpError, McpResult};

/// Lifecycle state of one tool-server connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Spawning,
    Initializing,
    Ready,
    Closing,
    Faulted,
    Closed,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerState::Spawning => "spawning",
            ServerState::Initializing => "initializing",
            ServerState::Ready => "ready",
            ServerState::Closing => "closing",
            ServerState::Faulted => "faulted",
            ServerState::Closed => "closed",
        };
        f.write_str(s)
    }
}

struct ServerHandle {
    state: ServerState,
    client: Option<McpClient>,
    tools: Vec<ToolDefinition>,
}

/// Owns every tool-server connection the host has opened for one
/// sandbox population. Thread-safe; a `Dispatcher`'s callback proxies
/// hold an `Arc<ToolServerManager>` and call `call_tool` by server +
/// raw tool name.
pub struct ToolServerManager {
    servers: DashMap<String, Arc<Mutex<ServerHandle>>>,
    default_timeout: Duration,
}

impl ToolServerManager {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            servers: DashMap::new(),
            default_timeout,
        }
    }

    /// Spawn a server, run its handshake, and discover its tools.
    /// Transitions `Spawning → Initializing → Ready`, or `Faulted` on
    /// any failure along the way.
    pub async fn connect(&self, name: &str, spec: &StdioServerSpec) -> McpResult<Vec<ToolDefinition>> {
        let handle = Arc::new(Mutex::new(ServerHandle {
            state: ServerState::Spawning,
            client: None,
            tools: Vec::new(),
        }));
        self.servers.insert(name.to_string(), handle.clone());

        let mut guard = handle.lock().await;
        guard.state = ServerState::Initializing;
        let connected = McpClient::connect(name, spec, self.default_timeout).await;
        let mut client = match connected {
            Ok(c) => c,
            Err(e) => {
                guard.state = ServerState::Faulted;
                warn!(server = name, error = %e, "tool server handshake failed");
                return Err(e);
            }
        };

        let tools = match client.list_tools().await {
            Ok(t) => t,
            Err(e) => {
                guard.state = ServerState::Faulted;
                warn!(server = name, error = %e, "tool discovery failed");
                return Err(e);
            }
        };

        info!(server = name, tools = tools.len(), "tool server ready");
        guard.tools = tools.clone();
        guard.client = Some(client);
        guard.state = ServerState::Ready;
        Ok(tools)
    }

    /// Tools discovered for `name`, or an error if the server is
    /// unknown. Empty if the server hasn't reached `Ready` yet.
    pub async fn list_tools(&self, name: &str) -> McpResult<Vec<ToolDefinition>> {
        let handle = self.servers.get(name).ok_or_else(|| McpError::UnknownServer(name.to_string()))?.clone();
        Ok(handle.lock().await.tools.clone())
    }

    /// Every tool definition across every `Ready` server, already
    /// namespaced `mcp.<server>.<tool>` — ready to feed a
    /// `CallbackRegistryBuilder`.
    pub async fn all_tools(&self) -> Vec<ToolDefinition> {
        let mut out = Vec::new();
        for entry in self.servers.iter() {
            let guard = entry.value().lock().await;
            if guard.state == ServerState::Ready {
                out.extend(guard.tools.iter().cloned());
            }
        }
        out
    }

    /// Invoke `raw_tool` on server `name`. Returns the callback-style
    /// `Result<Value, String>` shape so it plugs directly into
    /// `eryx_runtime::registry::Callback::new`.
    pub async fn call_tool(&self, name: &str, raw_tool: &str, args: Value) -> Result<Value, String> {
        let handle = self
            .servers
            .get(name)
            .ok_or_else(|| McpError::UnknownServer(name.to_string()).to_string())?
            .clone();
        let mut guard = handle.lock().await;
        if guard.state != ServerState::Ready {
            return Err(McpError::NotReady { name: name.to_string(), state: guard.state.to_string() }.to_string());
        }
        let client = guard.client.as_mut().expect("Ready implies client is set");
        client.call_tool(raw_tool, &args).await.map_err(|e| e.to_string())
    }

    /// Close one server: `Ready → Closing → Closed`. Idempotent on an
    /// already-closed or unknown server.
    pub async fn close(&self, name: &str) -> McpResult<()> {
        let Some((_, handle)) = self.servers.remove(name) else {
            return Ok(());
        };
        let mut guard = handle.lock().await;
        guard.state = ServerState::Closing;
        if let Some(client) = guard.client.as_mut() {
            client.shutdown().await;
        }
        guard.state = ServerState::Closed;
        Ok(())
    }

    /// Close every server this manager owns (spec §4.12: "torn down
    /// with the sandbox/session that opened them").
    pub async fn close_all(&self) {
        let names: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        for name in names {
            let _ = self.close(&name).await;
        }
    }

    pub async fn state(&self, name: &str) -> Option<ServerState> {
        let handle = self.servers.get(name)?.clone();
        Some(handle.lock().await.state)
    }
}

impl Default for ToolServerManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_server_lookup_is_an_error() {
        let manager = ToolServerManager::default();
        let err = manager.call_tool("nope", "tool", Value::Null).await.unwrap_err();
        assert!(err.contains("unknown tool server"));
    }

    #[tokio::test]
    async fn close_on_unknown_server_is_a_no_op() {
        let manager = ToolServerManager::default();
        manager.close("nope").await.unwrap();
    }

    #[tokio::test]
    async fn state_is_none_before_connect() {
        let manager = ToolServerManager::default();
        assert!(manager.state("nope").await.is_none());
    }
}
