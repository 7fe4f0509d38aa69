//! Sandbox — single-use executor (spec §4.9).
//!
//! `execute(code)` instantiates a fresh guest, drives it to completion,
//! and returns an `ExecuteResult`. No state survives across two
//! `execute` calls on a stateless `Sandbox` — each call gets its own
//! `GuestInstance`, `AsyncScheduler`, and a fresh `SecretsVault` clone.

use std::sync::Arc;
use std::time::Duration;

use eryx_types::{EryxResult, ExecuteResult, NetConfig, ResourceLimits, VolumeMount};

use crate::dispatcher::Dispatcher;
use crate::engine::Engine;
use crate::executor::{run_with_timeout, GuestInstance};
use crate::io_pumps::Sink;
use crate::net_policy::NetPolicy;
use crate::registry::{Callback, CallbackRegistry, CallbackRegistryBuilder};
use crate::scheduler::AsyncScheduler;
use crate::vault::SecretsVault;
use crate::vfs::Vfs;

/// Builder for a `Sandbox`. Collects callbacks, secrets, volumes, and
/// policy before the registry is frozen (spec §4.2: registration is
/// one-shot at build time).
pub struct SandboxBuilder {
    engine: Arc<Engine>,
    limits: ResourceLimits,
    net_config: NetConfig,
    volumes: Vec<VolumeMount>,
    registry: CallbackRegistryBuilder,
    secrets: Vec<(String, String, Option<Vec<String>>)>,
    on_stdout: Option<Sink>,
    on_stderr: Option<Sink>,
    scrub_enabled: bool,
}

impl SandboxBuilder {
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

    /// Disable output scrubbing for debugging (spec §4.3). Bound
    /// secrets are still usable, but their raw values may appear in
    /// captured output — only use this outside production paths.
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

    pub fn build(self) -> EryxResult<Sandbox> {
        let vfs = Vfs::new(self.volumes)?;
        let registry = self.registry.freeze();
        Ok(Sandbox {
            engine: self.engine,
            limits: self.limits,
            net_policy: NetPolicy::new(self.net_config),
            registry,
            secrets: self.secrets,
            vfs,
            on_stdout: self.on_stdout,
            on_stderr: self.on_stderr,
            scrub_enabled: self.scrub_enabled,
        })
    }
}

/// A single-use executor: build once, call `execute` as many times as
/// desired, each call fully isolated from the last.
pub struct Sandbox {
    engine: Arc<Engine>,
    limits: ResourceLimits,
    net_policy: NetPolicy,
    registry: CallbackRegistry,
    secrets: Vec<(String, String, Option<Vec<String>>)>,
    vfs: Vfs,
    on_stdout: Option<Sink>,
    on_stderr: Option<Sink>,
    scrub_enabled: bool,
}

impl Sandbox {
    pub fn builder(engine: Arc<Engine>) -> SandboxBuilder {
        SandboxBuilder::new(engine)
    }

    fn fresh_vault(&self) -> SecretsVault {
        let mut vault = SecretsVault::new(self.scrub_enabled);
        for (name, value, allow_hosts) in &self.secrets {
            vault.bind(name.clone(), value.clone(), allow_hosts.clone());
        }
        vault
    }

    pub async fn execute(&self, code: &str) -> EryxResult<ExecuteResult> {
        tracing::debug!(code_len = code.len(), "sandbox execute starting");
        let dispatcher = Arc::new(Dispatcher {
            registry: self.registry.clone(),
            vault: Arc::new(tokio::sync::Mutex::new(self.fresh_vault())),
            vfs: self.vfs.clone(),
            net_policy: self.net_policy.clone(),
            scheduler: Arc::new(AsyncScheduler::new(self.limits.max_callbacks)),
            callback_timeout: self.limits.callback_timeout_ms.map(Duration::from_millis),
            trace_sink: None,
        });

        let engine = self.engine.clone();
        let limits = self.limits;
        let code = code.to_string();
        let on_stdout = self.on_stdout.clone();
        let on_stderr = self.on_stderr.clone();
        let scheduler_handle = dispatcher.scheduler.clone();

        let timeout = limits.execution_timeout_ms.map(Duration::from_millis);
        let run = {
            let dispatcher = dispatcher.clone();
            move || -> EryxResult<(String, String, u64, Option<u64>)> {
                let mut instance = GuestInstance::instantiate(&engine, dispatcher, &limits)?
                    .with_sinks(on_stdout, on_stderr);
                let exec_result = instance.call_execute(&code);
                let (stdout, stderr) = instance.finish_pumps();
                let callback_count = instance.callback_count();
                let peak = instance.peak_memory_bytes();
                exec_result?;
                Ok((stdout, stderr, callback_count, peak))
            }
        };

        let outcome = run_with_timeout(engine.clone(), timeout, run).await;
        scheduler_handle.stop_accepting();
        scheduler_handle.cancel_all();

        let ((stdout, stderr, callback_count, peak_memory_bytes), duration) = outcome.map_err(|e| {
            tracing::warn!(error = %e, "sandbox execute failed");
            e
        })?;

        // A guest that caught and swallowed the scheduler's ceiling
        // rejection still reports `Ok`; surface the limit to the
        // caller regardless (spec §4.8/§7).
        if scheduler_handle.ceiling_hit() {
            let err = eryx_types::EryxError::ResourceLimit(
                "callback invocation ceiling exceeded during execution".into(),
            );
            tracing::warn!(error = %err, "sandbox execute failed");
            return Err(err);
        }
        tracing::debug!(duration_ms = duration.as_secs_f64() * 1000.0, callback_count, "sandbox execute finished");
        Ok(ExecuteResult {
            stdout,
            stderr,
            duration_ms: duration.as_secs_f64() * 1000.0,
            callback_count,
            peak_memory_bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Guest whose `execute` always reports success and writes a fixed
    /// line to stdout via `host_log`, mirroring the teacher's
    /// hand-assembled WAT fixtures.
    const HELLO_WAT: &str = r#"
        (module
            (import "eryx" "host_log" (func $host_log (param i32 i32 i32)))
            (memory (export "memory") 2)
            (data (i32.const 0) "hi")
            (data (i32.const 64) "{\"status\":\"ok\"}")
            (global $bump (mut i32) (i32.const 1024))

            (func (export "alloc") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $bump))
                (global.set $bump (i32.add (global.get $bump) (local.get $size)))
                (local.get $ptr)
            )

            (func (export "execute") (param $ptr i32) (param $len i32) (result i64)
                (call $host_log (i32.const 0) (i32.const 0) (i32.const 2))
                (i64.or (i64.shl (i64.const 64) (i64.const 32)) (i64.const 15))
            )

            (func (export "snapshot_state") (param $ptr i32) (param $len i32) (result i64)
                (i64.or (i64.shl (i64.const 64) (i64.const 32)) (i64.const 0))
            )
            (func (export "restore_state") (param $ptr i32) (param $len i32) (result i64)
                (i64.or (i64.shl (i64.const 64) (i64.const 32)) (i64.const 0))
            )
            (func (export "clear_state") (param $ptr i32) (param $len i32) (result i64)
                (i64.or (i64.shl (i64.const 64) (i64.const 32)) (i64.const 0))
            )
        )
    "#;

    const INFINITE_LOOP_WAT: &str = r#"
        (module
            (memory (export "memory") 1)
            (global $bump (mut i32) (i32.const 1024))
            (func (export "alloc") (param $size i32) (result i32)
                (global.get $bump)
            )
            (func (export "execute") (param $ptr i32) (param $len i32) (result i64)
                (loop $inf (br $inf))
                (i64.const 0)
            )
            (func (export "snapshot_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "restore_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "clear_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
        )
    "#;

    fn test_engine(wat: &str) -> Arc<Engine> {
        // `wasmtime::Module::new` accepts WAT text directly (the `wat`
        // feature is on by default), same as the teacher's fixtures.
        Arc::new(Engine::compile(wat.as_bytes()).expect("compiles"))
    }

    #[tokio::test]
    async fn execute_hello_captures_stdout() {
        let engine = test_engine(HELLO_WAT);
        let sandbox = Sandbox::builder(engine).build().unwrap();
        let result = sandbox.execute("print('hi')").await.unwrap();
        assert_eq!(result.stdout, "hi");
        assert_eq!(result.callback_count, 0);
    }

    #[tokio::test]
    async fn execution_timeout_surfaces_timeout_error() {
        let engine = test_engine(INFINITE_LOOP_WAT);
        let sandbox = Sandbox::builder(engine)
            .limits(ResourceLimits {
                execution_timeout_ms: Some(100),
                ..ResourceLimits::default()
            })
            .build()
            .unwrap();
        let err = sandbox.execute("while True: pass").await.unwrap_err();
        assert_eq!(err.kind_name(), "timeout");
    }

    #[tokio::test]
    async fn two_calls_on_one_sandbox_do_not_share_state() {
        let engine = test_engine(HELLO_WAT);
        let sandbox = Sandbox::builder(engine).build().unwrap();
        let first = sandbox.execute("print('hi')").await.unwrap();
        let second = sandbox.execute("print('hi')").await.unwrap();
        assert_eq!(first.stdout, second.stdout);
        assert_eq!(second.callback_count, 0);
    }

    /// Guest whose `execute` tries to grow linear memory by 100 pages
    /// (~6.4 MiB) and reports which status string based on whether
    /// `memory.grow` returned `-1`. Used to prove `ResourceLimits::max_memory_bytes`
    /// is an enforced ceiling, not just a `PeakMemory` sample (spec §4.1).
    const GROW_WAT: &str = r#"
        (module
            (memory (export "memory") 1)
            (data (i32.const 64) "{\"status\":\"ok\"}")
            (data (i32.const 96) "{\"status\":\"error\",\"traceback\":\"grow unexpectedly succeeded\"}")
            (global $bump (mut i32) (i32.const 1024))
            (func (export "alloc") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $bump))
                (global.set $bump (i32.add (global.get $bump) (local.get $size)))
                (local.get $ptr)
            )
            (func (export "execute") (param $ptr i32) (param $len i32) (result i64)
                (if (i32.eq (memory.grow (i32.const 100)) (i32.const -1))
                    (then (return (i64.or (i64.shl (i64.const 64) (i64.const 32)) (i64.const 15))))
                )
                (i64.or (i64.shl (i64.const 96) (i64.const 32)) (i64.const 60))
            )
            (func (export "snapshot_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "restore_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "clear_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
        )
    "#;

    /// Guest whose `execute` calls `invoke("echo", {})` once, discards
    /// whatever the host returns, and always reports success — the
    /// ceiling rejection must still surface to the caller even though
    /// the guest never propagates it (spec §4.8/§7).
    const INVOKE_AND_IGNORE_WAT: &str = r#"
        (module
            (import "eryx" "host_call" (func $host_call (param i32 i32) (result i64)))
            (memory (export "memory") 1)
            (data (i32.const 128) "{\"method\":\"invoke\",\"params\":{\"waitable_id\":1,\"name\":\"echo\",\"args\":{}}}")
            (data (i32.const 512) "{\"status\":\"ok\"}")
            (global $bump (mut i32) (i32.const 4096))
            (func (export "alloc") (param $size i32) (result i32)
                (local $ptr i32)
                (local.set $ptr (global.get $bump))
                (global.set $bump (i32.add (global.get $bump) (local.get $size)))
                (local.get $ptr)
            )
            (func (export "execute") (param $ptr i32) (param $len i32) (result i64)
                (drop (call $host_call (i32.const 128) (i32.const 70)))
                (i64.or (i64.shl (i64.const 512) (i64.const 32)) (i64.const 15))
            )
            (func (export "snapshot_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "restore_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "clear_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
        )
    "#;

    #[tokio::test]
    async fn callback_ceiling_surfaces_even_when_the_guest_swallows_it() {
        let engine = test_engine(INVOKE_AND_IGNORE_WAT);
        let sandbox = Sandbox::builder(engine)
            .limits(ResourceLimits {
                max_callbacks: Some(0),
                ..ResourceLimits::default()
            })
            .callback(Callback::new(
                eryx_types::ToolDefinition {
                    name: "echo".to_string(),
                    description: "echoes its input".into(),
                    input_schema: serde_json::json!({"type": "object"}),
                },
                |args| async move { Ok(args) },
            ))
            .unwrap()
            .build()
            .unwrap();

        let err = sandbox.execute("ignored").await.unwrap_err();
        assert_eq!(err.kind_name(), "resource_limit");
    }

    #[tokio::test]
    async fn max_memory_bytes_denies_growth_past_the_ceiling() {
        let engine = test_engine(GROW_WAT);
        let sandbox = Sandbox::builder(engine)
            .limits(ResourceLimits {
                max_memory_bytes: Some(64 * 1024), // exactly the module's 1-page initial size
                ..ResourceLimits::default()
            })
            .build()
            .unwrap();
        let result = sandbox.execute("ignored").await.unwrap();
        assert_eq!(result.stdout, "");
    }
}
