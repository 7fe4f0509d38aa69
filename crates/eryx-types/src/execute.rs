//! Result of a single `execute()` call.

/// Captured output and statistics from one `execute()` call.
///
/// Immutable once returned. Produced by both `Sandbox::execute` and
/// `Session::execute`.
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    /// Captured, scrubbed standard output.
    pub stdout: String,
    /// Captured, scrubbed standard error.
    pub stderr: String,
    /// Wall-clock duration of the call, in milliseconds.
    pub duration_ms: f64,
    /// Number of callback invocations (`invoke()` calls) the guest made.
    pub callback_count: u64,
    /// Peak linear memory observed during the run, if the engine could
    /// sample it.
    pub peak_memory_bytes: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn construct_and_read_fields() {
        let r = ExecuteResult {
            stdout: "hi\n".into(),
            stderr: String::new(),
            duration_ms: 1.5,
            callback_count: 0,
            peak_memory_bytes: Some(1024),
        };
        assert_eq!(r.stdout, "hi\n");
        assert_eq!(r.peak_memory_bytes, Some(1024));
    }
}
