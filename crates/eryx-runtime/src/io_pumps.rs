//! I/O Pumps — accumulate guest-emitted bytes, scrub secrets, fan out
//! to caller sinks.
//!
//! The guest never writes raw bytes past this module: every chunk
//! passes through `Pump::push` before it reaches either the final
//! `ExecuteResult` string or a registered `on_stdout`/`on_stderr` sink.

use std::sync::Arc;

use crate::vault::SecretsVault;

/// A chunk sink a caller registers to observe output as it streams,
/// rather than waiting for the final `ExecuteResult`.
pub type Sink = Arc<dyn Fn(&str) + Send + Sync>;

/// One output stream (stdout or stderr).
pub struct Pump {
    accumulated: String,
    /// Bytes withheld because they could be the prefix of a placeholder
    /// that hasn't fully arrived yet (spec §4.6 boundary safety).
    pending: String,
    sink: Option<Sink>,
}

impl Pump {
    pub fn new(sink: Option<Sink>) -> Self {
        Self {
            accumulated: String::new(),
            pending: String::new(),
            sink,
        }
    }

    /// Feed a freshly emitted chunk through the scrub table and fan it
    /// out. `max_placeholder_len` bounds how much trailing text must be
    /// withheld in case it's a placeholder prefix.
    pub fn push(&mut self, chunk: &str, vault: &SecretsVault) {
        self.pending.push_str(chunk);
        let max_len = vault.longest_placeholder_len();
        let hold_back = max_len.saturating_sub(1);

        let safe_len = self.pending.len().saturating_sub(hold_back);
        // Only flush up to a char boundary so we never split a UTF-8
        // sequence across pump calls.
        let mut boundary = safe_len;
        while boundary > 0 && !self.pending.is_char_boundary(boundary) {
            boundary -= 1;
        }
        if boundary == 0 {
            return;
        }

        let ready: String = self.pending.drain(..boundary).collect();
        let scrubbed = scrub(&ready, vault);
        self.emit(&scrubbed);
    }

    /// Flush any withheld bytes — call once at end-of-run.
    pub fn finish(&mut self, vault: &SecretsVault) {
        if self.pending.is_empty() {
            return;
        }
        let remaining = std::mem::take(&mut self.pending);
        let scrubbed = scrub(&remaining, vault);
        self.emit(&scrubbed);
    }

    fn emit(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        self.accumulated.push_str(text);
        if let Some(sink) = &self.sink {
            sink(text);
        }
    }

    pub fn into_string(self) -> String {
        self.accumulated
    }

    pub fn as_str(&self) -> &str {
        &self.accumulated
    }
}

/// Replace every occurrence of every bound placeholder with
/// `[REDACTED]`. Simple substring scan — placeholder tokens are fixed,
/// short, hex strings so a naive multi-needle scan is fast enough; a
/// real Aho-Corasick automaton would only help once the vault holds
/// hundreds of secrets.
pub fn scrub(text: &str, vault: &SecretsVault) -> String {
    let placeholders = vault.scrub_table();
    if placeholders.is_empty() {
        return text.to_string();
    }
    let mut out = text.to_string();
    for placeholder in placeholders {
        if out.contains(placeholder) {
            out = out.replace(placeholder, "[REDACTED]");
        }
    }
    out
}

/// Also used by the Call Dispatcher to scrub error messages crossing
/// the boundary (spec §4.3: "the scrub pipeline runs over error
/// messages too").
pub fn scrub_error(message: &str, vault: &SecretsVault) -> String {
    scrub(message, vault)
}
