//! Guest-facing ABI glue: the `GuestState` carried in every wasmtime
//! `Store`, and the `host_call`/`host_poll` imports the guest runtime
//! links against.
//!
//! Grounded on the teacher's `sandbox::GuestState` + `host_functions`
//! dispatch pair, generalized from a fixed capability-checked method
//! table into the full Eryx ABI: VFS ops, network checks, snapshot ops,
//! `list_callbacks`/`report_trace`, and `invoke` with its `Pending`
//! third state.

use std::sync::Arc;

use eryx_types::EryxError;
use serde_json::{json, Value};
use wasmtime::{Caller, Linker, StoreLimits};

use crate::dispatcher::{DispatchOutcome, Dispatcher};
use crate::engine::PeakMemory;
use crate::io_pumps::{scrub_error, Pump};
use crate::scheduler::Completion;

/// Import module name the guest links `host_call`/`host_poll` under.
pub const IMPORT_MODULE: &str = "eryx";

/// Per-`Store` state, mirroring the teacher's `GuestState` shape but
/// carrying the full dispatcher instead of a flat capability list.
pub struct GuestState {
    pub dispatcher: Arc<Dispatcher>,
    pub stdout: Pump,
    pub stderr: Pump,
    pub peak_memory_bytes: PeakMemory,
    pub tokio_handle: tokio::runtime::Handle,
    /// `Store::limiter` target: enforces spec §4.1's "hard ceiling on
    /// linear memory" by refusing any `memory.grow` past it, rather than
    /// only sampling peak usage after the fact.
    pub limits: StoreLimits,
}

impl GuestState {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        stdout: Pump,
        stderr: Pump,
        tokio_handle: tokio::runtime::Handle,
        limits: StoreLimits,
    ) -> Self {
        Self {
            dispatcher,
            stdout,
            stderr,
            peak_memory_bytes: PeakMemory::new(),
            tokio_handle,
            limits,
        }
    }
}

/// Register the `eryx` import module: `host_call(request_ptr, request_len) -> packed(ptr,len)`
/// and `host_poll(waitable_id) -> packed(ptr,len)`. Both follow the
/// teacher's ptr/len packing convention (`(ptr << 32) | len`) so the
/// guest's existing alloc/memory ABI needs no change.
pub fn install_host_functions(linker: &mut Linker<GuestState>) -> Result<(), anyhow::Error> {
    linker.func_wrap(
        IMPORT_MODULE,
        "host_call",
        |mut caller: Caller<'_, GuestState>, request_ptr: i32, request_len: i32| -> Result<i64, anyhow::Error> {
            let request_bytes = read_guest_bytes(&mut caller, request_ptr, request_len)?;
            let request: Value = serde_json::from_slice(&request_bytes)?;
            let response = dispatch_sync(&mut caller, &request);
            write_guest_json(&mut caller, &response)
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "host_poll",
        |mut caller: Caller<'_, GuestState>, waitable_id: i64| -> Result<i64, anyhow::Error> {
            let completions = caller.data().dispatcher.scheduler.poll(waitable_id as u64);
            let encoded: Vec<Value> = completions
                .into_iter()
                .map(|(promise_id, completion)| match completion {
                    Completion::Ok(v) => json!({"promise_id": promise_id, "status": "ok", "result": v}),
                    Completion::Err(e) => json!({"promise_id": promise_id, "status": "err", "error": e}),
                })
                .collect();
            write_guest_json(&mut caller, &json!({"completions": encoded}))
        },
    )?;

    linker.func_wrap(
        IMPORT_MODULE,
        "host_log",
        |mut caller: Caller<'_, GuestState>, stream: i32, ptr: i32, len: i32| -> Result<(), anyhow::Error> {
            let bytes = read_guest_bytes(&mut caller, ptr, len)?;
            let text = String::from_utf8_lossy(&bytes).into_owned();
            // `host_log` runs on the blocking thread driving the guest
            // (see `sandbox::run_blocking`), so a blocking lock here
            // never contends with an async-context waiter.
            let dispatcher = caller.data().dispatcher.clone();
            let vault = dispatcher.vault.blocking_lock();
            let state = caller.data_mut();
            match stream {
                0 => state.stdout.push(&text, &vault),
                _ => state.stderr.push(&text, &vault),
            }
            Ok(())
        },
    )?;

    Ok(())
}

fn read_guest_bytes(caller: &mut Caller<'_, GuestState>, ptr: i32, len: i32) -> Result<Vec<u8>, anyhow::Error> {
    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest module has no 'memory' export"))?;
    let data = memory.data(&caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize).ok_or_else(|| anyhow::anyhow!("length overflow"))?;
    if end > data.len() {
        anyhow::bail!("host_call: request out of bounds");
    }
    Ok(data[start..end].to_vec())
}

fn write_guest_json(caller: &mut Caller<'_, GuestState>, value: &Value) -> Result<i64, anyhow::Error> {
    let bytes = serde_json::to_vec(value)?;
    let alloc_fn = caller
        .get_export("alloc")
        .and_then(|e| e.into_func())
        .ok_or_else(|| anyhow::anyhow!("guest module has no 'alloc' export"))?
        .typed::<i32, i32>(&caller)?;
    let ptr = alloc_fn.call(&mut *caller, bytes.len() as i32)?;

    let memory = caller
        .get_export("memory")
        .and_then(|e| e.into_memory())
        .ok_or_else(|| anyhow::anyhow!("guest module has no 'memory' export"))?;
    caller.data_mut().peak_memory_bytes.observe(memory.data_size(&caller) as u64);
    let mem_data = memory.data_mut(&mut *caller);
    let start = ptr as usize;
    let end = start + bytes.len();
    if end > mem_data.len() {
        anyhow::bail!("host_call: response exceeds guest memory bounds");
    }
    mem_data[start..end].copy_from_slice(&bytes);
    Ok(((ptr as i64) << 32) | bytes.len() as i64)
}

/// Route one decoded `host_call` request to the right synchronous
/// handler, or to `Dispatcher::invoke` for the async shape. Mirrors
/// `host_functions::dispatch`'s match-on-method-name structure.
fn dispatch_sync(caller: &mut Caller<'_, GuestState>, request: &Value) -> Value {
    let method = request.get("method").and_then(Value::as_str).unwrap_or("");
    let params = request.get("params").cloned().unwrap_or(Value::Null);
    let dispatcher = caller.data().dispatcher.clone();

    let result: Result<Value, EryxError> = match method {
        "list_callbacks" => Ok(json!(dispatcher.list_callbacks())),

        "report_trace" => {
            let lineno = params.get("lineno").and_then(Value::as_u64).unwrap_or(0) as u32;
            let event = params.get("event").cloned().unwrap_or(Value::Null);
            let payload = params.get("payload").cloned().unwrap_or(Value::Null);
            dispatcher.report_trace(lineno, event, payload);
            Ok(Value::Null)
        }

        "invoke" => {
            let waitable_id = params.get("waitable_id").and_then(Value::as_u64).unwrap_or(0);
            let name = params.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let args = params.get("args").cloned().unwrap_or(Value::Null);
            return dispatcher.invoke(waitable_id, &name, args).to_json();
        }

        "waitable_set_new" => Ok(json!(dispatcher.scheduler.waitable_set_new())),
        "waitable_set_drop" => {
            if let Some(id) = params.get("waitable_id").and_then(Value::as_u64) {
                dispatcher.scheduler.waitable_set_drop(id);
            }
            Ok(Value::Null)
        }
        "subtask_drop" => {
            if let Some(id) = params.get("promise_id").and_then(Value::as_u64) {
                dispatcher.scheduler.subtask_drop(id);
            }
            Ok(Value::Null)
        }

        "vfs_stat" => str_param(&params, "path").and_then(|p| dispatcher.vfs_stat(&p)).map(|s| {
            json!({"kind": if s.kind == crate::vfs::FileKind::File {"file"} else {"dir"}, "len": s.len})
        }),
        "vfs_read" => str_param(&params, "path")
            .and_then(|p| dispatcher.vfs_read(&p))
            .map(|bytes| json!(base64_encode(&bytes))),
        "vfs_write" => {
            let path = str_param(&params, "path");
            let data = params.get("data").and_then(Value::as_str).map(base64_decode);
            let append = params.get("append").and_then(Value::as_bool).unwrap_or(false);
            match (path, data) {
                (Ok(path), Some(Ok(data))) => dispatcher.vfs_write(&path, &data, append).map(|_| Value::Null),
                _ => Err(EryxError::Policy("invalid vfs_write params".into())),
            }
        }
        "vfs_mkdir" => str_param(&params, "path").and_then(|p| dispatcher.vfs_mkdir(&p)).map(|_| Value::Null),
        "vfs_unlink" => str_param(&params, "path").and_then(|p| dispatcher.vfs_unlink(&p)).map(|_| Value::Null),
        "vfs_rename" => {
            let from = str_param(&params, "from");
            let to = str_param(&params, "to");
            match (from, to) {
                (Ok(from), Ok(to)) => dispatcher.vfs_rename(&from, &to).map(|_| Value::Null),
                (Err(e), _) | (_, Err(e)) => Err(e),
            }
        }
        "vfs_list" => str_param(&params, "path").and_then(|p| dispatcher.vfs_list(&p)).map(|v| json!(v)),

        "env_read" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or_default();
            match dispatcher.env_read(name) {
                Some(placeholder) => Ok(json!(placeholder)),
                None => Ok(Value::Null),
            }
        }

        "net_check" => {
            let host = params.get("host").and_then(Value::as_str).unwrap_or_default();
            let port = params.get("port").and_then(Value::as_u64).unwrap_or(0) as u16;
            dispatcher.net_check(host, port, &[]).map(|_| Value::Null)
        }

        other => Err(EryxError::Guest(format!("unknown host_call method: {other}"))),
    };

    match result {
        Ok(v) => json!({"status": "ok", "result": v}),
        Err(e) => json!({"status": "err", "error": e.to_string()}),
    }
}

fn str_param(params: &Value, key: &str) -> Result<String, EryxError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| EryxError::Guest(format!("missing '{key}' parameter")))
}

fn base64_encode(bytes: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Result<Vec<u8>, EryxError> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| EryxError::Guest(format!("invalid base64 payload: {e}")))
}

/// Classify a trap raised out of a guest call into the matching
/// `EryxError`, applying the scrub pipeline to its message (spec §7:
/// "no error ever carries a raw secret").
pub fn trap_to_error(err: anyhow::Error, dispatcher: &Dispatcher, elapsed_ms: u64) -> EryxError {
    let class = crate::engine::classify_trap(&err);
    if matches!(class, crate::engine::TrapClass::Interrupted) {
        return EryxError::Timeout {
            kind: eryx_types::TimeoutKind::Execution,
            elapsed_ms,
        };
    }
    let vault = dispatcher.vault.try_lock();
    let detail = match vault {
        Ok(v) => scrub_error(&err.to_string(), &v),
        Err(_) => err.to_string(),
    };
    class.into_error(detail)
}
