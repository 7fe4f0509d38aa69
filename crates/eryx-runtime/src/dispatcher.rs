//! Call Dispatcher — implements the guest→host call ABI (spec §4.7).
//!
//! Generalizes the teacher's single `host_call` method-name dispatch
//! (`sandbox.rs`/`host_functions.rs`) into the two call shapes the spec
//! requires: synchronous built-ins that return immediately, and
//! `invoke(name, args)` which may come back `Pending` and resolve later
//! through the `AsyncScheduler`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use eryx_types::{EryxError, EryxResult, ToolDefinition};
use serde_json::{json, Value};

use crate::net_policy::NetPolicy;
use crate::registry::CallbackRegistry;
use crate::scheduler::{AsyncScheduler, Completion, PromiseId, WaitableId};
use crate::vault::SecretsVault;
use crate::vfs::Vfs;

/// The 3-way result shape crossing the guest→host `invoke` boundary
/// (spec §4.7 ABI).
#[derive(Debug, Clone)]
pub enum DispatchOutcome {
    Ok(Value),
    Err(String),
    Pending { waitable_id: WaitableId, promise_id: PromiseId },
}

impl DispatchOutcome {
    /// Encode as the JSON envelope the guest's runtime unpacks, e.g.
    /// `{"status":"pending","waitable_id":1,"promise_id":3}`.
    pub fn to_json(&self) -> Value {
        match self {
            DispatchOutcome::Ok(v) => json!({"status": "ok", "result": v}),
            DispatchOutcome::Err(e) => json!({"status": "err", "error": e}),
            DispatchOutcome::Pending { waitable_id, promise_id } => json!({
                "status": "pending",
                "waitable_id": waitable_id,
                "promise_id": promise_id,
            }),
        }
    }
}

/// Everything the dispatcher needs to service one guest instance's
/// calls. Built once per `Sandbox`/`Session` execute(), shared with the
/// `AsyncScheduler`'s spawned sub-tasks.
pub struct Dispatcher {
    pub registry: CallbackRegistry,
    pub vault: Arc<tokio::sync::Mutex<SecretsVault>>,
    pub vfs: Vfs,
    pub net_policy: NetPolicy,
    pub scheduler: Arc<AsyncScheduler>,
    pub callback_timeout: Option<Duration>,
    pub trace_sink: Option<Arc<dyn Fn(u32, Value, Value) + Send + Sync>>,
}

impl Dispatcher {
    /// Synchronous built-ins: `list_callbacks`, `report_trace`, VFS and
    /// network primitives, snapshot ops. These run on the host task
    /// currently driving the guest and return immediately.
    pub fn list_callbacks(&self) -> Vec<ToolDefinition> {
        self.registry.list().into_iter().cloned().collect()
    }

    pub fn report_trace(&self, lineno: u32, event: Value, payload: Value) {
        if let Some(sink) = &self.trace_sink {
            sink(lineno, event, payload);
        }
    }

    pub fn vfs_stat(&self, path: &str) -> EryxResult<crate::vfs::Stat> {
        self.vfs.stat(path)
    }

    pub fn vfs_read(&self, path: &str) -> EryxResult<Vec<u8>> {
        self.vfs.read(path)
    }

    pub fn vfs_write(&self, path: &str, data: &[u8], append: bool) -> EryxResult<()> {
        self.vfs.write(path, data, append)
    }

    pub fn vfs_mkdir(&self, path: &str) -> EryxResult<()> {
        self.vfs.mkdir(path)
    }

    pub fn vfs_unlink(&self, path: &str) -> EryxResult<()> {
        self.vfs.unlink(path)
    }

    pub fn vfs_rename(&self, from: &str, to: &str) -> EryxResult<()> {
        self.vfs.rename(from, to)
    }

    pub fn vfs_list(&self, path: &str) -> EryxResult<Vec<String>> {
        self.vfs.list(path)
    }

    /// Network connect-permission check — the enforcer (spec §4.4).
    /// `resolved` is the set of IPs the host's own resolver returned for
    /// `host`, used to defeat DNS-rebinding bypasses of a hostname
    /// allow-list entry.
    pub fn net_check(&self, host: &str, port: u16, resolved: &[std::net::IpAddr]) -> EryxResult<()> {
        self.net_policy.check(host, port, resolved)
    }

    /// Look a bound secret's placeholder up by name, for the guest's
    /// environment-variable-like view (spec §4.3: "reads of bound names
    /// return the placeholder string, never the raw value"). Called
    /// from the synchronous `host_call` path, so it takes the vault's
    /// blocking lock rather than the async one — safe here because
    /// guest execution itself runs on a dedicated blocking thread (see
    /// `executor::run_with_timeout`).
    pub fn env_read(&self, name: &str) -> Option<String> {
        self.vault.blocking_lock().placeholder_for(name).map(str::to_string)
    }

    /// `invoke(name, args_json)` — the async call shape. Validates the
    /// callback exists, acquires a scheduler slot, and spawns the
    /// handler as a host sub-task. Returns `Pending` immediately; the
    /// actual result reaches the guest when it next polls the
    /// returned `waitable_id`.
    pub fn invoke(self: &Arc<Self>, waitable_id: WaitableId, name: &str, args: Value) -> DispatchOutcome {
        let Some(callback) = self.registry.lookup(name) else {
            return DispatchOutcome::Err(format!("unknown callback: {name}"));
        };

        let (promise_id, cancelled) = match self.scheduler.acquire(waitable_id) {
            Ok(pair) => pair,
            Err(e) => return DispatchOutcome::Err(e.to_string()),
        };

        let handler = callback.handler_handle();
        let scheduler = self.scheduler.clone();
        let timeout = self.callback_timeout;

        tokio::spawn(async move {
            let started = Instant::now();
            let fut = handler(args);
            let outcome = match timeout {
                Some(d) => match tokio::time::timeout(d, fut).await {
                    Ok(r) => r,
                    Err(_) => Err(format!(
                        "callback timed out after {}ms",
                        started.elapsed().as_millis()
                    )),
                },
                None => fut.await,
            };
            if cancelled.load(std::sync::atomic::Ordering::Relaxed) {
                return;
            }
            let completion = match outcome {
                Ok(v) => Completion::Ok(v),
                Err(e) => Completion::Err(e),
            };
            scheduler.resolve(promise_id, completion);
        });

        DispatchOutcome::Pending { waitable_id, promise_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_outcome_json_shapes() {
        assert_eq!(
            DispatchOutcome::Ok(json!(1)).to_json(),
            json!({"status": "ok", "result": 1})
        );
        assert_eq!(
            DispatchOutcome::Err("boom".into()).to_json(),
            json!({"status": "err", "error": "boom"})
        );
        assert_eq!(
            DispatchOutcome::Pending { waitable_id: 1, promise_id: 2 }.to_json(),
            json!({"status": "pending", "waitable_id": 1, "promise_id": 2})
        );
    }
}
