//! Resource ceilings enforced on a running sandbox.

/// Resource ceilings for one sandbox/session instance.
///
/// `None` means unbounded for the timeout fields; `0` is not treated
/// specially — an execution timeout of zero would fire immediately, so
/// callers who want "unbounded" must pass `None`, matching the engine's
/// epoch-interruption semantics (no deadline is armed when `None`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    /// Wall-clock budget for one `execute()` call, in milliseconds.
    pub execution_timeout_ms: Option<u64>,
    /// Wall-clock budget for one pending callback, in milliseconds.
    pub callback_timeout_ms: Option<u64>,
    /// Ceiling on guest linear memory, in bytes.
    pub max_memory_bytes: Option<u64>,
    /// Ceiling on the number of callback invocations per `execute()` call.
    pub max_callbacks: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            execution_timeout_ms: Some(30_000),
            callback_timeout_ms: Some(10_000),
            max_memory_bytes: Some(128 * 1024 * 1024),
            max_callbacks: Some(1000),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.execution_timeout_ms, Some(30_000));
        assert_eq!(limits.callback_timeout_ms, Some(10_000));
        assert_eq!(limits.max_memory_bytes, Some(128 * 1024 * 1024));
        assert_eq!(limits.max_callbacks, Some(1000));
    }
}
