//! Error kinds surfaced across the sandbox/session boundary.
//!
//! One variant per error kind in the spec: Initialization, Execution,
//! Timeout, ResourceLimit, Policy, Codec, Guest. Every variant's message
//! passes through the same scrub pipeline as stdout/stderr before it
//! reaches a caller (see `eryx_runtime::io_pumps`), so no error message
//! may embed a raw secret value.

use thiserror::Error;

/// Which deadline fired when a `Timeout` error is raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// The whole `execute()` call exceeded `ResourceLimits::execution_timeout_ms`.
    Execution,
    /// A single pending callback exceeded `ResourceLimits::callback_timeout_ms`.
    Callback,
}

impl std::fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Execution => write!(f, "execution"),
            TimeoutKind::Callback => write!(f, "callback"),
        }
    }
}

/// Top-level error type returned by sandbox/session operations.
#[derive(Error, Debug)]
pub enum EryxError {
    /// Engine/artifact load failed, or a tool-server handshake failed.
    #[error("Initialization failed: {0}")]
    Initialization(String),

    /// The guest raised an uncaught exception. Carries the rendered traceback.
    #[error("Execution failed: {traceback}")]
    Execution {
        /// Traceback text as rendered by the guest runtime.
        traceback: String,
    },

    /// Execution or per-callback deadline exceeded.
    #[error("Timeout ({kind}) after {elapsed_ms}ms")]
    Timeout {
        /// Which deadline fired.
        kind: TimeoutKind,
        /// How long the call ran before being cut off.
        elapsed_ms: u64,
    },

    /// Memory or callback-count ceiling hit.
    #[error("Resource limit exceeded: {0}")]
    ResourceLimit(String),

    /// A network or VFS operation was denied by policy.
    #[error("Policy denied: {0}")]
    Policy(String),

    /// Snapshot too large, malformed, or version mismatch.
    #[error("Snapshot codec error: {0}")]
    Codec(String),

    /// A trap not attributable to any of the above (OOM, invalid instruction).
    #[error("Guest trap: {0}")]
    Guest(String),

    /// An I/O error reaching a host volume or subprocess.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EryxError {
    /// Short, stable name for the error kind — useful for client-side branching
    /// without matching on the full `Display` text.
    pub fn kind_name(&self) -> &'static str {
        match self {
            EryxError::Initialization(_) => "initialization",
            EryxError::Execution { .. } => "execution",
            EryxError::Timeout { .. } => "timeout",
            EryxError::ResourceLimit(_) => "resource_limit",
            EryxError::Policy(_) => "policy",
            EryxError::Codec(_) => "codec",
            EryxError::Guest(_) => "guest",
            EryxError::Io(_) => "io",
        }
    }
}

/// Alias for `Result<T, EryxError>`.
pub type EryxResult<T> = Result<T, EryxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(EryxError::Policy("denied".into()).kind_name(), "policy");
        assert_eq!(
            EryxError::Timeout {
                kind: TimeoutKind::Callback,
                elapsed_ms: 10_000
            }
            .kind_name(),
            "timeout"
        );
    }

    #[test]
    fn timeout_display_names_which_deadline() {
        let err = EryxError::Timeout {
            kind: TimeoutKind::Execution,
            elapsed_ms: 30_000,
        };
        assert!(err.to_string().contains("execution"));
    }
}
