//! Error type for tool-server lifecycle and JSON-RPC failures.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum McpError {
    #[error("failed to spawn tool server '{name}': {detail}")]
    Spawn { name: String, detail: String },

    #[error("tool server '{name}' handshake failed: {detail}")]
    Handshake { name: String, detail: String },

    #[error("tool server '{name}' JSON-RPC error {code}: {message}")]
    Rpc { name: String, code: i64, message: String },

    #[error("tool server '{name}' closed its stdout before responding")]
    ConnectionClosed { name: String },

    #[error("tool server '{name}' request timed out after {elapsed_ms}ms")]
    Timeout { name: String, elapsed_ms: u64 },

    #[error("unknown tool server: {0}")]
    UnknownServer(String),

    #[error("tool server '{name}' is not ready (state: {state})")]
    NotReady { name: String, state: String },

    #[error("malformed server config table: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type McpResult<T> = Result<T, McpError>;
