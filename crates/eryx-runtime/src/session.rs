//! Session — stateful executor reusing one guest instance across many
//! `execute` calls (spec §4.10).
//!
//! Unlike `Sandbox`, a `Session`'s WASM linear memory and globals
//! persist between calls — only the per-call `Dispatcher` (vault,
//! scheduler, trace sink) and the stdout/stderr pumps are rebuilt each
//! time, via `GuestInstance::rebind`. Calls are serialized by taking the
//! single guest instance out of a `tokio::sync::Mutex`, so "at most one
//! execute in flight, concurrent callers wait FIFO" holds without a
//! separate queue.

use std::sync::Arc;
use std::time::Duration;

use eryx_types::{EryxError, EryxResult, ExecuteResult, NetConfig, ResourceLimits, VolumeMount};

use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::executor::{run_with_timeout, GuestInstance};
use crate::io_pumps::Sink;
use crate::net_policy::NetPolicy;
use crate::registry::{Callback, CallbackRegistry, CallbackRegistryBuilder};
use crate::scheduler::AsyncScheduler;
use crate::snapshot::{SnapshotCodec, DEFAULT_MAX_SNAPSHOT_BYTES};
use crate::vault::SecretsVault;
use crate::vfs::Vfs;

/// Builder for a `Session`. Mirrors `SandboxBuilder`; the registry is
/// frozen the same way at `build()` (spec §4.2).
pub struct SessionBuilder {
    engine: Arc<Engine>,
    limits: ResourceLimits,
    net_config: NetConfig,
    volumes: Vec<VolumeMount>,
    registry: CallbackRegistryBuilder,
    secrets: Vec<(String, String, Option<Vec<String>>)>,
    on_stdout: Option<Sink>,
    on_stderr: Option<Sink>,
    scrub_enabled: bool,
    max_snapshot_bytes: usize,
}

impl SessionBuilder {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            engine,
            limits: ResourceLimits::default(),
            net_config: NetConfig::default(),
            volumes: Vec::new(),
            registry: CallbackRegistryBuilder::new(),
            secrets: Vec::new(),
            on_stdout: None,
            on_stderr: None,
            scrub_enabled: true,
            max_snapshot_bytes: DEFAULT_MAX_SNAPSHOT_BYTES,
        }
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn net_config(mut self, config: NetConfig) -> Self {
        self.net_config = config;
        self
    }

    pub fn volume(mut self, mount: VolumeMount) -> Self {
        self.volumes.push(mount);
        self
    }

    pub fn callback(mut self, callback: Callback) -> EryxResult<Self> {
        self.registry.register(callback)?;
        Ok(self)
    }

    pub fn secret(mut self, name: impl Into<String>, value: impl Into<String>, allow_hosts: Option<Vec<String>>) -> Self {
        self.secrets.push((name.into(), value.into(), allow_hosts));
        self
    }

    pub fn disable_scrubbing(mut self) -> Self {
        self.scrub_enabled = false;
        self
    }

    pub fn on_stdout(mut self, sink: Sink) -> Self {
        self.on_stdout = Some(sink);
        self
    }

    pub fn on_stderr(mut self, sink: Sink) -> Self {
        self.on_stderr = Some(sink);
        self
    }

    pub fn max_snapshot_bytes(mut self, bytes: usize) -> Self {
        self.max_snapshot_bytes = bytes;
        self
    }

    pub fn build(self) -> EryxResult<Session> {
        let vfs = Vfs::new(self.volumes)?;
        let registry = self.registry.freeze();
        let net_policy = NetPolicy::new(self.net_config);
        let secrets = self.secrets;
        let limits = self.limits;
        let scrub_enabled = self.scrub_enabled;

        let dispatcher = build_dispatcher(&registry, &net_policy, &vfs, &secrets, scrub_enabled, &limits);
        let instance = GuestInstance::instantiate(&self.engine, dispatcher, &limits)?;

        Ok(Session {
            engine: self.engine,
            limits,
            net_policy,
            registry,
            vfs,
            secrets,
            on_stdout: self.on_stdout,
            on_stderr: self.on_stderr,
            scrub_enabled,
            instance: tokio::sync::Mutex::new(Some(instance)),
            snapshot_codec: SnapshotCodec::new(self.max_snapshot_bytes),
        })
    }
}

fn fresh_vault(secrets: &[(String, String, Option<Vec<String>>)], scrub_enabled: bool) -> SecretsVault {
    let mut vault = SecretsVault::new(scrub_enabled);
    for (name, value, allow_hosts) in secrets {
        vault.bind(name.clone(), value.clone(), allow_hosts.clone());
    }
    vault
}

fn build_dispatcher(
    registry: &CallbackRegistry,
    net_policy: &NetPolicy,
    vfs: &Vfs,
    secrets: &[(String, String, Option<Vec<String>>)],
    scrub_enabled: bool,
    limits: &ResourceLimits,
) -> Arc<Dispatcher> {
    Arc::new(Dispatcher {
        registry: registry.clone(),
        vault: Arc::new(tokio::sync::Mutex::new(fresh_vault(secrets, scrub_enabled))),
        vfs: vfs.clone(),
        net_policy: net_policy.clone(),
        scheduler: Arc::new(AsyncScheduler::new(limits.max_callbacks)),
        callback_timeout: limits.callback_timeout_ms.map(Duration::from_millis),
        trace_sink: None,
    })
}

/// A long-lived executor: one guest instance, called repeatedly.
/// `snapshot_state`/`restore_state`/`clear_state` expose the guest's own
/// opaque state blob through the `SnapshotCodec`'s size ceiling.
pub struct Session {
    engine: Arc<Engine>,
    limits: ResourceLimits,
    net_policy: NetPolicy,
    registry: CallbackRegistry,
    vfs: Vfs,
    secrets: Vec<(String, String, Option<Vec<String>>)>,
    on_stdout: Option<Sink>,
    on_stderr: Option<Sink>,
    scrub_enabled: bool,
    instance: tokio::sync::Mutex<Option<GuestInstance>>,
    snapshot_codec: SnapshotCodec,
}

impl Session {
    pub fn builder(engine: Arc<Engine>) -> SessionBuilder {
        SessionBuilder::new(engine)
    }

    fn fresh_dispatcher(&self) -> Arc<Dispatcher> {
        build_dispatcher(&self.registry, &self.net_policy, &self.vfs, &self.secrets, self.scrub_enabled, &self.limits)
    }

    /// Run `code` against the session's persistent guest instance.
    /// Waits for any call already in flight, then holds the instance
    /// exclusively for the duration of this one.
    pub async fn execute(&self, code: &str) -> EryxResult<ExecuteResult> {
        let mut slot = self.instance.lock().await;
        let instance = slot.take().ok_or_else(|| {
            EryxError::Guest("session's guest instance was lost after a prior trap".into())
        })?;

        let dispatcher = self.fresh_dispatcher();
        let scheduler = dispatcher.scheduler.clone();
        let mut instance = instance;
        instance.rebind(dispatcher, self.on_stdout.clone(), self.on_stderr.clone());

        let timeout = self.limits.execution_timeout_ms.map(Duration::from_millis);
        let engine = self.engine.clone();
        let code = code.to_string();

        // The guest instance travels into the blocking-task closure and
        // back out only when the `Store` is still known-healthy: a
        // guest-caught exception (`EryxError::Execution`) leaves the
        // instance usable, but a real trap or timeout (`ResourceLimit`,
        // `Timeout`, `Guest`, ...) does not — wasmtime advises against
        // resuming a `Store` past an unrecovered trap, so those cases
        // return `None` and the session's slot is left empty.
        let run = move || -> EryxResult<(Option<GuestInstance>, EryxResult<(String, String, u64, Option<u64>)>)> {
            let exec_result = instance.call_execute(&code);
            let (stdout, stderr) = instance.finish_pumps();
            let callback_count = instance.callback_count();
            let peak = instance.peak_memory_bytes();
            let keep_instance = matches!(exec_result, Ok(()) | Err(EryxError::Execution { .. }));
            let payload = exec_result.map(|_| (stdout, stderr, callback_count, peak));
            let returned_instance = if keep_instance { Some(instance) } else { None };
            Ok((returned_instance, payload))
        };

        let outcome = run_with_timeout(engine, timeout, run).await;
        scheduler.stop_accepting();
        scheduler.cancel_all();

        match outcome {
            Ok(((instance, payload), duration)) => {
                if let Some(instance) = instance {
                    *slot = Some(instance);
                } else {
                    tracing::warn!("session guest instance discarded after trap or timeout");
                }
                let (stdout, stderr, callback_count, peak_memory_bytes) = payload?;

                // Surface the callback ceiling even if the guest caught
                // and swallowed it (spec §4.8/§7).
                if scheduler.ceiling_hit() {
                    return Err(EryxError::ResourceLimit(
                        "callback invocation ceiling exceeded during execution".into(),
                    ));
                }
                Ok(ExecuteResult {
                    stdout,
                    stderr,
                    duration_ms: duration.as_secs_f64() * 1000.0,
                    callback_count,
                    peak_memory_bytes,
                })
            }
            Err(e) => {
                // `run_with_timeout` only fails this way when the guest
                // outran even the timeout's own grace period and the
                // blocking task never returned — the slot is left empty
                // here too, since the instance never came back at all.
                tracing::warn!(error = %e, "session guest instance discarded after trap or timeout");
                Err(e)
            }
        }
    }

    /// `snapshot_state() -> bytes` (spec §4.11). Validates the guest's
    /// blob against the codec's size ceiling before handing it back.
    pub async fn snapshot_state(&self) -> EryxResult<Vec<u8>> {
        let mut slot = self.instance.lock().await;
        let instance = slot.as_mut().ok_or_else(|| {
            EryxError::Guest("session's guest instance was lost after a prior trap".into())
        })?;
        let bytes = instance.call_snapshot_state()?;
        self.snapshot_codec.validate_outgoing(&bytes)?;
        Ok(bytes)
    }

    /// `restore_state(bytes)` (spec §4.11). Rejects an oversized or
    /// empty blob before it ever reaches the guest.
    pub async fn restore_state(&self, bytes: &[u8]) -> EryxResult<()> {
        self.snapshot_codec.validate_incoming(bytes)?;
        let mut slot = self.instance.lock().await;
        let instance = slot.as_mut().ok_or_else(|| {
            EryxError::Guest("session's guest instance was lost after a prior trap".into())
        })?;
        instance.call_restore_state(bytes)
    }

    /// `clear_state()` (spec §4.11). Resets the guest's own globals
    /// without discarding the `Session`'s callbacks, secrets, or VFS.
    pub async fn clear_state(&self) -> EryxResult<()> {
        let mut slot = self.instance.lock().await;
        let instance = slot.as_mut().ok_or_else(|| {
            EryxError::Guest("session's guest instance was lost after a prior trap".into())
        })?;
        instance.call_clear_state()
    }
}
