//! Tool-server config discovery — wire contract only (spec §6): this
//! crate parses and validates a config table an external caller has
//! already located on disk, it does not walk the filesystem looking
//! for one (that's the out-of-scope CLI's job).
//!
//! Grounded on the teacher's `McpServerConfig`/`McpTransport::Stdio`
//! shape (`mcp.rs`), generalized to the handful of top-level key names
//! different tool ecosystems use for the same table (`mcpServers`,
//! `servers`, `context_servers` in JSON; `mcp_servers` in TOML).

use std::collections::HashMap;

use serde::Deserialize;

use crate::error::{McpError, McpResult};

/// One subprocess tool-server entry, after env interpolation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StdioServerSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Environment variables passed to the subprocess, already
    /// interpolated against the host process's own environment.
    pub env: HashMap<String, String>,
}

/// Wire shape of one entry before interpolation — matches both the
/// `mcpServers`/`servers`/`context_servers` JSON shape and the
/// `mcp_servers` TOML shape field-for-field. Includes the fields that
/// decide whether an entry is a stdio tool server at all (spec §6):
/// `type`, `disabled`/`enabled`, and the remote-only URL aliases that,
/// when present, mark an entry as belonging to a transport this crate
/// doesn't speak.
#[derive(Debug, Deserialize)]
struct RawServerEntry {
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    disabled: Option<bool>,
    #[serde(default)]
    enabled: Option<bool>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    #[serde(rename = "serverUrl")]
    server_url: Option<String>,
    #[serde(default)]
    #[serde(rename = "httpUrl")]
    http_url: Option<String>,
}

impl RawServerEntry {
    /// Spec §6: included iff `type == "stdio"` (or absent), `disabled`
    /// is not true, `enabled` is not false, `command` is set, and no
    /// remote-only `url`/`serverUrl`/`httpUrl` dominates.
    fn is_stdio_server(&self) -> bool {
        let type_ok = matches!(self.r#type.as_deref(), None | Some("stdio"));
        let not_disabled = self.disabled != Some(true);
        let not_disabled_by_enabled = self.enabled != Some(false);
        let has_command = self.command.is_some();
        let no_remote_url = self.url.is_none() && self.server_url.is_none() && self.http_url.is_none();
        type_ok && not_disabled && not_disabled_by_enabled && has_command && no_remote_url
    }
}

/// The three JSON top-level keys in the wild, plus the one TOML key.
/// `parse_server_table` is handed one `key` to look under explicitly —
/// callers that don't know which key their file uses can try each in
/// turn.
pub const JSON_TABLE_KEYS: &[&str] = &["mcpServers", "servers", "context_servers"];
pub const TOML_TABLE_KEY: &str = "mcp_servers";

/// Parse a server table out of raw JSON or TOML text. Tries JSON first
/// (the common case); falls back to TOML if that fails to parse at
/// all. `key` names the top-level table to read (e.g. `"mcpServers"`
/// for JSON, `"mcp_servers"` for TOML).
///
/// Every `env` value is run through [`interpolate_env`] against the
/// *host* process's environment before being returned — the subprocess
/// itself never sees `$VAR` syntax, only its resolved value.
pub fn parse_server_table(json_or_toml: &str, key: &str) -> McpResult<Vec<(String, StdioServerSpec)>> {
    let raw: HashMap<String, RawServerEntry> = match serde_json::from_str::<serde_json::Value>(json_or_toml) {
        Ok(value) => {
            let table = value
                .get(key)
                .ok_or_else(|| McpError::Config(format!("no '{key}' table in config")))?;
            serde_json::from_value(table.clone())
                .map_err(|e| McpError::Config(format!("malformed '{key}' table: {e}")))?
        }
        Err(_) => {
            let value: toml::Value = toml::from_str(json_or_toml)
                .map_err(|e| McpError::Config(format!("config is neither valid JSON nor TOML: {e}")))?;
            let table = value
                .get(key)
                .ok_or_else(|| McpError::Config(format!("no '{key}' table in config")))?;
            table
                .clone()
                .try_into()
                .map_err(|e| McpError::Config(format!("malformed '{key}' table: {e}")))?
        }
    };

    let mut out: Vec<(String, StdioServerSpec)> = raw
        .into_iter()
        .filter(|(_, entry)| entry.is_stdio_server())
        .map(|(name, entry)| {
            let env = entry
                .env
                .into_iter()
                .map(|(k, v)| (k, interpolate_env(&v)))
                .collect();
            let command = entry.command.expect("is_stdio_server checked command.is_some()");
            (
                name,
                StdioServerSpec {
                    command,
                    args: entry.args,
                    env,
                },
            )
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(out)
}

/// Expand `$VAR`, `${VAR}`, and `${VAR:-default}` references against
/// the host process's environment. An unset `$VAR`/`${VAR}` with no
/// default expands to the empty string, matching common shell
/// behavior under `set +u`.
pub fn interpolate_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(dollar_pos) = rest.find('$') {
        out.push_str(&rest[..dollar_pos]);
        let tail = &rest[dollar_pos + 1..];

        if let Some(after_brace) = tail.strip_prefix('{') {
            if let Some(end) = after_brace.find('}') {
                out.push_str(&resolve_braced(&after_brace[..end]));
                rest = &after_brace[end + 1..];
                continue;
            }
            out.push('$');
            rest = tail;
            continue;
        }

        let ident_len = tail
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(tail.len());
        if ident_len == 0 {
            out.push('$');
            rest = tail;
        } else {
            out.push_str(&std::env::var(&tail[..ident_len]).unwrap_or_default());
            rest = &tail[ident_len..];
        }
    }
    out.push_str(rest);
    out
}

fn resolve_braced(inner: &str) -> String {
    if let Some((name, default)) = inner.split_once(":-") {
        std::env::var(name).unwrap_or_else(|_| default.to_string())
    } else {
        std::env::var(inner).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_brace_var_expands() {
        std::env::set_var("ERYX_MCP_TEST_TOKEN", "sk-abc");
        assert_eq!(interpolate_env("Bearer ${ERYX_MCP_TEST_TOKEN}"), "Bearer sk-abc");
        std::env::remove_var("ERYX_MCP_TEST_TOKEN");
    }

    #[test]
    fn bare_dollar_var_expands() {
        std::env::set_var("ERYX_MCP_TEST_TOKEN2", "sk-def");
        assert_eq!(interpolate_env("$ERYX_MCP_TEST_TOKEN2/rest"), "sk-def/rest");
        std::env::remove_var("ERYX_MCP_TEST_TOKEN2");
    }

    #[test]
    fn default_fallback_used_when_unset() {
        std::env::remove_var("ERYX_MCP_TEST_MISSING");
        assert_eq!(interpolate_env("${ERYX_MCP_TEST_MISSING:-fallback}"), "fallback");
    }

    #[test]
    fn parse_json_mcp_servers_table() {
        let json = r#"{
            "mcpServers": {
                "github": {"command": "npx", "args": ["-y", "server-github"], "env": {"TOKEN": "x"}}
            }
        }"#;
        let parsed = parse_server_table(json, "mcpServers").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "github");
        assert_eq!(parsed[0].1.command, "npx");
    }

    #[test]
    fn parse_toml_mcp_servers_table() {
        let toml_text = r#"
            [mcp_servers.fs]
            command = "mcp-server-filesystem"
            args = ["/tmp"]
        "#;
        let parsed = parse_server_table(toml_text, "mcp_servers").unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].0, "fs");
        assert_eq!(parsed[0].1.args, vec!["/tmp".to_string()]);
    }

    #[test]
    fn missing_key_is_an_error() {
        let json = r#"{"servers": {}}"#;
        let err = parse_server_table(json, "mcpServers").unwrap_err();
        assert!(matches!(err, McpError::Config(_)));
    }

    #[test]
    fn disabled_entry_is_excluded() {
        let json = r#"{
            "mcpServers": {
                "github": {"command": "npx", "disabled": true}
            }
        }"#;
        let parsed = parse_server_table(json, "mcpServers").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn enabled_false_entry_is_excluded() {
        let json = r#"{
            "mcpServers": {
                "github": {"command": "npx", "enabled": false}
            }
        }"#;
        let parsed = parse_server_table(json, "mcpServers").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn remote_only_entry_is_excluded() {
        let json = r#"{
            "mcpServers": {
                "remote": {"command": "npx", "url": "https://example.com/mcp"}
            }
        }"#;
        let parsed = parse_server_table(json, "mcpServers").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn non_stdio_type_entry_is_excluded() {
        let json = r#"{
            "mcpServers": {
                "sse": {"type": "sse", "command": "npx", "serverUrl": "https://example.com"}
            }
        }"#;
        let parsed = parse_server_table(json, "mcpServers").unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn explicit_stdio_type_with_no_command_is_excluded() {
        let json = r#"{
            "mcpServers": {
                "broken": {"type": "stdio"}
            }
        }"#;
        let parsed = parse_server_table(json, "mcpServers").unwrap();
        assert!(parsed.is_empty());
    }
}
