//! Factory — compiles the guest artifact once and stamps out
//! `Sandbox`/`Session` instances from a shared baseline (spec §4.13).
//!
//! Grounded on the teacher's pattern of holding one expensive
//! `wasmtime::Engine`/`Module` pair and handing every request its own
//! cheap per-run state: `create_sandbox`/`create_session` clone the
//! `Arc<Engine>` (free) plus the baseline's limits/policy/volumes/
//! callbacks/secrets (cheap — a handful of small values and `Arc`
//! clones), never recompiling the module.

use std::sync::Arc;

use eryx_types::{EryxResult, NetConfig, ResourceLimits, VolumeMount};

use crate::engine::Engine;
use crate::registry::Callback;
use crate::sandbox::Sandbox;
use crate::session::Session;

/// Baseline configuration shared by every `Sandbox`/`Session` this
/// factory stamps out. Build once per guest artifact; `create_sandbox`/
/// `create_session` may still layer per-run callbacks/secrets on top
/// before calling `build()` on the returned builder.
pub struct Factory {
    engine: Arc<Engine>,
    limits: ResourceLimits,
    net_config: NetConfig,
    volumes: Vec<VolumeMount>,
    callbacks: Vec<Callback>,
    secrets: Vec<(String, String, Option<Vec<String>>)>,
    scrub_enabled: bool,
}

impl Factory {
    /// Compile `wasm_bytes` once; the returned `Factory` is reused for
    /// every sandbox/session stamped from this guest artifact.
    pub fn compile(wasm_bytes: &[u8]) -> EryxResult<Self> {
        Ok(Self {
            engine: Arc::new(Engine::compile(wasm_bytes)?),
            limits: ResourceLimits::default(),
            net_config: NetConfig::default(),
            volumes: Vec::new(),
            callbacks: Vec::new(),
            secrets: Vec::new(),
            scrub_enabled: true,
        })
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

    /// Register a baseline callback every sandbox/session stamped from
    /// this factory will carry.
    pub fn callback(mut self, callback: Callback) -> Self {
        self.callbacks.push(callback);
        self
    }

    pub fn secret(mut self, name: impl Into<String>, value: impl Into<String>, allow_hosts: Option<Vec<String>>) -> Self {
        self.secrets.push((name.into(), value.into(), allow_hosts));
        self
    }

    pub fn disable_scrubbing(mut self) -> Self {
        self.scrub_enabled = false;
        self
    }

    /// A builder pre-loaded with this factory's baseline — add any
    /// per-run callbacks, secrets, or volumes before calling `build()`.
    pub fn create_sandbox(&self) -> EryxResult<crate::sandbox::SandboxBuilder> {
        let mut builder = Sandbox::builder(self.engine.clone())
            .limits(self.limits)
            .net_config(self.net_config.clone());
        if !self.scrub_enabled {
            builder = builder.disable_scrubbing();
        }
        for volume in &self.volumes {
            builder = builder.volume(volume.clone());
        }
        for callback in &self.callbacks {
            builder = builder.callback(callback.clone())?;
        }
        for (name, value, allow_hosts) in &self.secrets {
            builder = builder.secret(name.clone(), value.clone(), allow_hosts.clone());
        }
        Ok(builder)
    }

    /// Same as `create_sandbox`, but for a long-lived `Session`.
    pub fn create_session(&self) -> EryxResult<crate::session::SessionBuilder> {
        let mut builder = Session::builder(self.engine.clone())
            .limits(self.limits)
            .net_config(self.net_config.clone());
        if !self.scrub_enabled {
            builder = builder.disable_scrubbing();
        }
        for volume in &self.volumes {
            builder = builder.volume(volume.clone());
        }
        for callback in &self.callbacks {
            builder = builder.callback(callback.clone())?;
        }
        for (name, value, allow_hosts) in &self.secrets {
            builder = builder.secret(name.clone(), value.clone(), allow_hosts.clone());
        }
        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO_WAT: &str = r#"
        (module
            (memory (export "memory") 1)
            (data (i32.const 64) "{\"status\":\"ok\"}")
            (global $bump (mut i32) (i32.const 1024))
            (func (export "alloc") (param $size i32) (result i32) (global.get $bump))
            (func (export "execute") (param $ptr i32) (param $len i32) (result i64)
                (i64.or (i64.shl (i64.const 64) (i64.const 32)) (i64.const 15))
            )
            (func (export "snapshot_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "restore_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
            (func (export "clear_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
        )
    "#;

    #[tokio::test]
    async fn two_sandboxes_from_one_factory_are_independent() {
        let factory = Factory::compile(HELLO_WAT.as_bytes()).unwrap();
        let a = factory.create_sandbox().unwrap().build().unwrap();
        let b = factory.create_sandbox().unwrap().build().unwrap();
        let ra = a.execute("print('hi')").await.unwrap();
        let rb = b.execute("print('hi')").await.unwrap();
        assert_eq!(ra.callback_count, rb.callback_count);
    }

    #[tokio::test]
    async fn create_session_seeds_baseline_secret() {
        let factory = Factory::compile(HELLO_WAT.as_bytes())
            .unwrap()
            .secret("TOKEN", "sk-abc", None);
        let session = factory.create_session().unwrap().build().unwrap();
        let result = session.execute("print('hi')").await.unwrap();
        assert_eq!(result.callback_count, 0);
    }
}
