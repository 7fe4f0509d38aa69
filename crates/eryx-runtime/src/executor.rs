//! Drives one guest instance through the host↔guest export/import ABI.
//!
//! Shared by `Sandbox` (fresh instance per call) and `Session` (one
//! instance reused across calls). Grounded on the teacher's
//! `execute_sync` — same alloc/memory marshalling, generalized to the
//! four guest exports the spec names (`execute`, `snapshot_state`,
//! `restore_state`, `clear_state`) instead of one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use eryx_types::{EryxError, EryxResult, ResourceLimits};
use serde_json::Value;
use wasmtime::{Instance, Store};

use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::guest::{self, GuestState};
use crate::io_pumps::Pump;

/// One compiled, linked, instantiated guest — the unit of work `execute`
/// drives.
pub struct GuestInstance {
    store: Store<GuestState>,
    instance: Instance,
}

impl GuestInstance {
    pub fn instantiate(engine: &Engine, dispatcher: Arc<Dispatcher>, limits: &ResourceLimits) -> EryxResult<Self> {
        let state = GuestState::new(
            dispatcher,
            Pump::new(None),
            Pump::new(None),
            tokio::runtime::Handle::current(),
            Engine::store_limits(limits),
        );
        let mut store = engine.new_store(limits, state)?;
        let mut linker = engine.new_linker();
        guest::install_host_functions(&mut linker)
            .map_err(|e| EryxError::Initialization(format!("linking host imports: {e}")))?;
        let instance = linker
            .instantiate(&mut store, engine.module())
            .map_err(|e| EryxError::Initialization(format!("instantiation failed: {e}")))?;
        Ok(Self { store, instance })
    }

    pub fn with_sinks(mut self, stdout: Option<crate::io_pumps::Sink>, stderr: Option<crate::io_pumps::Sink>) -> Self {
        self.store.data_mut().stdout = Pump::new(stdout);
        self.store.data_mut().stderr = Pump::new(stderr);
        self
    }

    /// Swap in a fresh per-call `Dispatcher` and output pumps while
    /// keeping this instance's `Store` — and so its WASM linear memory
    /// and globals — untouched. A `Session` calls this before every
    /// `execute`: the guest's own state persists across calls, but its
    /// callback budget, vault, and captured output start clean each
    /// time (spec §4.10).
    pub fn rebind(&mut self, dispatcher: Arc<Dispatcher>, stdout: Option<crate::io_pumps::Sink>, stderr: Option<crate::io_pumps::Sink>) {
        let state = self.store.data_mut();
        state.dispatcher = dispatcher;
        state.stdout = Pump::new(stdout);
        state.stderr = Pump::new(stderr);
        state.peak_memory_bytes = crate::engine::PeakMemory::new();
    }

    /// `execute(code: str) -> str` (spec §6). The returned JSON string
    /// is `{"status":"ok"}` on success or `{"status":"error","traceback":"..."}`
    /// for an uncaught guest exception.
    pub fn call_execute(&mut self, code: &str) -> EryxResult<()> {
        let result_json = self.call_str_export("execute", code.as_bytes())?;
        let parsed: Value = serde_json::from_slice(&result_json)
            .map_err(|e| EryxError::Execution { traceback: format!("malformed guest response: {e}") })?;
        match parsed.get("status").and_then(Value::as_str) {
            Some("ok") => Ok(()),
            Some("error") => Err(EryxError::Execution {
                traceback: self.scrub_for_caller(
                    parsed
                        .get("traceback")
                        .and_then(Value::as_str)
                        .unwrap_or("<no traceback>"),
                ),
            }),
            _ => Err(EryxError::Execution {
                traceback: "guest returned an unrecognized status".to_string(),
            }),
        }
    }

    /// Run a guest-supplied string through the scrub pipeline before it
    /// reaches the caller (spec §7: "no error ever carries a raw
    /// secret"). A guest traceback can only ever contain placeholders,
    /// never raw values, but this keeps every error path uniformly
    /// scrubbed rather than relying on that being true everywhere.
    fn scrub_for_caller(&self, text: &str) -> String {
        match self.store.data().dispatcher.vault.try_lock() {
            Ok(vault) => crate::io_pumps::scrub_error(text, &vault),
            Err(_) => text.to_string(),
        }
    }

    pub fn call_snapshot_state(&mut self) -> EryxResult<Vec<u8>> {
        self.call_str_export("snapshot_state", b"")
    }

    pub fn call_restore_state(&mut self, bytes: &[u8]) -> EryxResult<()> {
        self.call_str_export("restore_state", bytes).map(|_| ())
    }

    pub fn call_clear_state(&mut self) -> EryxResult<()> {
        self.call_str_export("clear_state", b"").map(|_| ())
    }

    fn call_str_export(&mut self, name: &str, input: &[u8]) -> EryxResult<Vec<u8>> {
        // Re-arm the one-tick epoch deadline: a `Session` reuses this
        // `Store` across many calls, so each call needs its own
        // deadline — `run_with_timeout`'s watchdog only bumps the
        // engine epoch once per call.
        self.store.set_epoch_deadline(1);
        let memory = self
            .instance
            .get_memory(&mut self.store, "memory")
            .ok_or_else(|| EryxError::Initialization("guest module has no 'memory' export".into()))?;
        let alloc_fn = self
            .instance
            .get_typed_func::<i32, i32>(&mut self.store, "alloc")
            .map_err(|e| EryxError::Initialization(format!("guest module missing 'alloc': {e}")))?;
        let export_fn = self
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut self.store, name)
            .map_err(|e| EryxError::Initialization(format!("guest module missing '{name}': {e}")))?;

        let ptr = alloc_fn
            .call(&mut self.store, input.len() as i32)
            .map_err(|e| EryxError::Guest(format!("alloc failed: {e}")))?;
        let mem = memory.data_mut(&mut self.store);
        let start = ptr as usize;
        let end = start + input.len();
        if end > mem.len() {
            return Err(EryxError::Guest("input exceeds guest memory bounds".into()));
        }
        mem[start..end].copy_from_slice(input);

        let packed = export_fn
            .call(&mut self.store, (ptr, input.len() as i32))
            .map_err(|e| {
                let dispatcher = self.store.data().dispatcher.clone();
                guest::trap_to_error(e, &dispatcher, 0)
            })?;

        let out_ptr = (packed >> 32) as usize;
        let out_len = (packed & 0xFFFF_FFFF) as usize;
        let mem = memory.data(&self.store);
        if out_ptr + out_len > mem.len() {
            return Err(EryxError::Guest("result pointer out of bounds".into()));
        }
        Ok(mem[out_ptr..out_ptr + out_len].to_vec())
    }

    pub fn finish_pumps(&mut self) -> (String, String) {
        let dispatcher = self.store.data().dispatcher.clone();
        let vault = dispatcher.vault.blocking_lock();
        let state = self.store.data_mut();
        state.stdout.finish(&vault);
        state.stderr.finish(&vault);
        drop(vault);
        let state = self.store.data_mut();
        (
            std::mem::replace(&mut state.stdout, Pump::new(None)).into_string(),
            std::mem::replace(&mut state.stderr, Pump::new(None)).into_string(),
        )
    }

    pub fn peak_memory_bytes(&self) -> Option<u64> {
        self.store.data().peak_memory_bytes.load()
    }

    pub fn callback_count(&self) -> u64 {
        self.store.data().dispatcher.scheduler.callback_count()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.store.data().dispatcher.clone()
    }
}

/// Run `f` on a dedicated blocking thread (guest execution is CPU-bound
/// and must not starve the tokio reactor), racing it against
/// `timeout` and the engine's own epoch watchdog. Returns the
/// blocking closure's result, or a `Timeout` error if `timeout` elapses
/// first.
pub async fn run_with_timeout<T: Send + 'static>(
    engine: Arc<Engine>,
    timeout: Option<Duration>,
    f: impl FnOnce() -> EryxResult<T> + Send + 'static,
) -> EryxResult<(T, Duration)> {
    let started = Instant::now();
    let _watchdog = engine.arm_deadline(timeout);
    let join = tokio::task::spawn_blocking(move || f());

    let result = match timeout {
        Some(d) => match tokio::time::timeout(d + Duration::from_millis(250), join).await {
            Ok(r) => r,
            Err(_) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                tracing::warn!(elapsed_ms, timeout_ms = d.as_millis() as u64, "execution timed out, interrupting guest");
                return Err(EryxError::Timeout {
                    kind: eryx_types::TimeoutKind::Execution,
                    elapsed_ms,
                })
            }
        },
        None => join.await,
    };

    let value = result.map_err(|e| EryxError::Guest(format!("execution task panicked: {e}")))??;
    Ok((value, started.elapsed()))
}
