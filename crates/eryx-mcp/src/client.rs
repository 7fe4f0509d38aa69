//! JSON-RPC 2.0 client over a subprocess's stdio (spec §4.12).
//!
//! Grounded directly on the teacher's `McpConnection` stdio transport
//! (`mcp.rs`): newline-delimited JSON-RPC requests on the child's
//! stdin, one response line read back per request. The SSE transport
//! variant the teacher also supports has no counterpart here — this
//! crate's tool servers are subprocesses only (spec §4.12 names no
//! other transport).

use std::process::Stdio;
use std::time::Duration;

use eryx_types::ToolDefinition;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::StdioServerSpec;
use crate::error::{McpError, McpResult};

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Deserialize)]
struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    jsonrpc: String,
    #[allow(dead_code)]
    id: Option<u64>,
    result: Option<Value>,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

/// One live connection to a tool-server subprocess.
pub struct McpClient {
    name: String,
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    next_id: u64,
    timeout: Duration,
}

impl McpClient {
    /// Spawn the subprocess and perform the `initialize` →
    /// `notifications/initialized` handshake (spec §4.12). Does not
    /// discover tools — call `list_tools` separately so a caller can
    /// observe the `Initializing` → `Ready` transition itself.
    pub async fn connect(name: &str, spec: &StdioServerSpec, timeout: Duration) -> McpResult<Self> {
        if spec.command.contains("..") {
            return Err(McpError::Spawn {
                name: name.to_string(),
                detail: "command path contains '..'".into(),
            });
        }

        let mut cmd = tokio::process::Command::new(&spec.command);
        cmd.args(&spec.args);
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::null());
        cmd.env_clear();
        for (k, v) in &spec.env {
            cmd.env(k, v);
        }
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        let mut child = cmd.spawn().map_err(|e| McpError::Spawn {
            name: name.to_string(),
            detail: e.to_string(),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::Spawn {
            name: name.to_string(),
            detail: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::Spawn {
            name: name.to_string(),
            detail: "failed to capture stdout".into(),
        })?;

        let mut client = Self {
            name: name.to_string(),
            child,
            stdin,
            stdout: BufReader::new(stdout),
            next_id: 1,
            timeout,
        };

        client.initialize().await?;
        Ok(client)
    }

    async fn initialize(&mut self) -> McpResult<()> {
        let params = serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {},
            "clientInfo": {"name": "eryx", "version": env!("CARGO_PKG_VERSION")},
        });
        self.send_request("initialize", Some(params)).await?;
        self.send_notification("notifications/initialized", None).await
    }

    /// `tools/list` — returns the server's tools namespaced
    /// `mcp.<server>.<tool>` (spec §4.12), ready to hand to a
    /// `CallbackRegistryBuilder`.
    pub async fn list_tools(&mut self) -> McpResult<Vec<ToolDefinition>> {
        let response = self.send_request("tools/list", None).await?;
        let mut tools = Vec::new();
        if let Some(array) = response.get("tools").and_then(Value::as_array) {
            for tool in array {
                let raw_name = tool.get("name").and_then(Value::as_str).unwrap_or("unnamed");
                let description = tool.get("description").and_then(Value::as_str).unwrap_or("");
                let input_schema = tool
                    .get("inputSchema")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!({"type": "object"}));
                tools.push(ToolDefinition {
                    name: ToolDefinition::mcp_name(&self.name, raw_name),
                    description: description.to_string(),
                    input_schema,
                });
            }
        }
        Ok(tools)
    }

    /// `tools/call` — `raw_name` is the server's own tool name (already
    /// stripped of the `mcp.<server>.` prefix by the caller).
    pub async fn call_tool(&mut self, raw_name: &str, arguments: &Value) -> McpResult<Value> {
        let params = serde_json::json!({"name": raw_name, "arguments": arguments});
        let result = self.send_request("tools/call", Some(params)).await?;
        if let Some(content) = result.get("content").and_then(Value::as_array) {
            let texts: Vec<&str> = content
                .iter()
                .filter_map(|item| {
                    (item.get("type").and_then(Value::as_str) == Some("text"))
                        .then(|| item.get("text").and_then(Value::as_str))
                        .flatten()
                })
                .collect();
            Ok(Value::String(texts.join("\n")))
        } else {
            Ok(result)
        }
    }

    async fn send_request(&mut self, method: &str, params: Option<Value>) -> McpResult<Value> {
        let id = self.next_id;
        self.next_id += 1;
        let request = JsonRpcRequest { jsonrpc: "2.0", id, method, params };
        let line = serde_json::to_string(&request).expect("JsonRpcRequest always serializes");

        self.stdin
            .write_all(line.as_bytes())
            .await
            .map_err(McpError::Io)?;
        self.stdin.write_all(b"\n").await.map_err(McpError::Io)?;
        self.stdin.flush().await.map_err(McpError::Io)?;

        let mut raw = String::new();
        match tokio::time::timeout(self.timeout, self.stdout.read_line(&mut raw)).await {
            Ok(Ok(0)) => {
                return Err(McpError::ConnectionClosed { name: self.name.clone() });
            }
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(McpError::Io(e)),
            Err(_) => {
                return Err(McpError::Timeout {
                    name: self.name.clone(),
                    elapsed_ms: self.timeout.as_millis() as u64,
                })
            }
        }

        let response: JsonRpcResponse = serde_json::from_str(raw.trim()).map_err(|e| McpError::Handshake {
            name: self.name.clone(),
            detail: format!("invalid JSON-RPC response: {e}"),
        })?;
        if let Some(err) = response.error {
            return Err(McpError::Rpc { name: self.name.clone(), code: err.code, message: err.message });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    async fn send_notification(&mut self, method: &str, params: Option<Value>) -> McpResult<()> {
        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or_else(|| serde_json::json!({})),
        });
        let line = serde_json::to_string(&notification).expect("always serializes");
        self.stdin.write_all(line.as_bytes()).await.map_err(McpError::Io)?;
        self.stdin.write_all(b"\n").await.map_err(McpError::Io)?;
        self.stdin.flush().await.map_err(McpError::Io)
    }

    /// Best-effort subprocess teardown, used by `ToolServerManager`
    /// when moving a server to `Closed`.
    pub async fn shutdown(&mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}
