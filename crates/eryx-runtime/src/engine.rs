//! Guest engine: compiles the WASM artifact once and stamps out fresh
//! instances with per-run resource limits.
//!
//! Mirrors the teacher's `WasmSandbox` (fuel + epoch interruption) but
//! generalized: the Factory compiles a module once (§4.13) and every
//! `Sandbox`/`Session` asks the engine for a fresh `GuestInstance` sized
//! to its own `ResourceLimits`.

use std::sync::Arc;
use std::time::Duration;

use eryx_types::{EryxError, EryxResult, ResourceLimits};
use wasmtime::{Config, Engine as WasmEngine, Linker, Module, Store, StoreLimitsBuilder, Trap};

use crate::guest::GuestState;

/// Which trap class fired, so the caller can map it to the right
/// `EryxError` variant (spec §4.1: oom, fuel-exhausted, interrupted,
/// guest-panic).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapClass {
    OutOfMemory,
    FuelExhausted,
    Interrupted,
    GuestPanic,
}

/// Classify a wasmtime trap into one of the four classes the spec
/// distinguishes. Anything unrecognized is reported as `GuestPanic`,
/// which callers surface as `EryxError::Guest`.
pub fn classify_trap(err: &anyhow::Error) -> TrapClass {
    if let Some(trap) = err.downcast_ref::<Trap>() {
        return match *trap {
            Trap::OutOfFuel => TrapClass::FuelExhausted,
            Trap::Interrupt => TrapClass::Interrupted,
            Trap::MemoryOutOfBounds | Trap::HeapMisaligned => TrapClass::OutOfMemory,
            _ => TrapClass::GuestPanic,
        };
    }
    TrapClass::GuestPanic
}

impl TrapClass {
    pub fn into_error(self, detail: impl Into<String>) -> EryxError {
        let detail = detail.into();
        match self {
            TrapClass::OutOfMemory => EryxError::ResourceLimit(format!("guest OOM: {detail}")),
            TrapClass::FuelExhausted => EryxError::ResourceLimit(format!(
                "guest CPU budget exhausted: {detail}"
            )),
            TrapClass::Interrupted => EryxError::Timeout {
                kind: eryx_types::TimeoutKind::Execution,
                elapsed_ms: 0,
            },
            TrapClass::GuestPanic => EryxError::Guest(detail),
        }
    }
}

/// Compiled guest artifact plus the wasmtime `Engine` it was compiled
/// with. Expensive to build; built once per `Factory`.
pub struct Engine {
    wasm_engine: WasmEngine,
    module: Module,
}

impl Engine {
    /// Compile `wasm_bytes` (binary or WAT) with fuel metering and
    /// epoch interruption enabled — the two mechanisms the Async
    /// Scheduler and execution-timeout enforcement ride on.
    pub fn compile(wasm_bytes: &[u8]) -> EryxResult<Self> {
        // Guest execution runs on a blocking thread (see
        // `sandbox::run_blocking`), not on the tokio async store support
        // wasmtime offers — the guest's own asyncio-style loop polls
        // the host synchronously via repeated `host_call`s, matching
        // the single-threaded cooperative model in spec §5.
        let mut config = Config::new();
        config.consume_fuel(true);
        config.epoch_interruption(true);
        let wasm_engine = WasmEngine::new(&config)
            .map_err(|e| EryxError::Initialization(format!("engine config: {e}")))?;
        let module = Module::new(&wasm_engine, wasm_bytes)
            .map_err(|e| EryxError::Initialization(format!("module compile: {e}")))?;
        tracing::debug!(bytes = wasm_bytes.len(), "compiled guest module");
        Ok(Self { wasm_engine, module })
    }

    pub fn wasm_engine(&self) -> &WasmEngine {
        &self.wasm_engine
    }

    pub fn module(&self) -> &Module {
        &self.module
    }

    /// Build a fresh `Store` + `Linker` pair sized to `limits`.
    ///
    /// Only the `Store`'s fuel and epoch deadline are configured here;
    /// host imports are registered by `guest::install_host_functions`
    /// once the caller has its dispatcher/scheduler ready.
    pub fn new_store(&self, limits: &ResourceLimits, state: GuestState) -> EryxResult<Store<GuestState>> {
        let mut store = Store::new(&self.wasm_engine, state);
        // A large-but-finite default keeps unbounded limits from
        // silently disabling fuel metering (fuel-exhaustion traps
        // still need to be classifiable for the `Guest` trap path).
        let fuel = limits
            .max_callbacks
            .map(|c| c.saturating_mul(1_000_000).max(10_000_000))
            .unwrap_or(u64::MAX / 2);
        store
            .set_fuel(fuel)
            .map_err(|e| EryxError::Initialization(format!("set_fuel: {e}")))?;
        store.set_epoch_deadline(1);
        // Hard ceiling on linear memory (spec §4.1): a `memory.grow`
        // past this size is refused rather than merely observed after
        // the fact by `PeakMemory`.
        store.limiter(|state| &mut state.limits);
        Ok(store)
    }

    /// Build the `StoreLimits` a fresh `GuestState` carries, sized to
    /// `limits.max_memory_bytes` (unbounded when the caller leaves it
    /// unset).
    pub fn store_limits(limits: &ResourceLimits) -> wasmtime::StoreLimits {
        let mut builder = StoreLimitsBuilder::new();
        if let Some(max) = limits.max_memory_bytes {
            builder = builder.memory_size(max as usize);
        }
        builder.build()
    }

    pub fn new_linker(&self) -> Linker<GuestState> {
        Linker::new(&self.wasm_engine)
    }

    /// Spawn the watchdog thread that bumps the engine epoch once the
    /// execution timeout elapses, interrupting whichever `Store` is
    /// mid-poll. Spec §5: "Execution timeout interrupts the guest
    /// within at most one epoch tick after the deadline" — we pick a
    /// tick granularity well under typical timeouts.
    pub fn arm_deadline(&self, timeout: Option<Duration>) -> Option<std::thread::JoinHandle<()>> {
        let timeout = timeout?;
        let engine = self.wasm_engine.clone();
        Some(std::thread::spawn(move || {
            std::thread::sleep(timeout);
            engine.increment_epoch();
        }))
    }
}

/// Peak linear memory observed for a guest instance, sampled via the
/// store's memory export after the run completes.
pub fn sample_peak_memory(store: &Store<GuestState>) -> Option<u64> {
    store.data().peak_memory_bytes.load()
}

pub(crate) struct PeakMemory(std::sync::atomic::AtomicU64);

impl PeakMemory {
    pub fn new() -> Self {
        Self(std::sync::atomic::AtomicU64::new(0))
    }

    pub fn observe(&self, bytes: u64) {
        self.0.fetch_max(bytes, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn load(&self) -> Option<u64> {
        let v = self.0.load(std::sync::atomic::Ordering::Relaxed);
        if v == 0 {
            None
        } else {
            Some(v)
        }
    }
}

pub(crate) type SharedEngine = Arc<Engine>;
