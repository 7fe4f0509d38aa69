//! End-to-end ABI scenarios (spec §8) driven against a real guest
//! module rather than unit-level calls into individual components.

use std::sync::Arc;

use eryx_runtime::{Callback, Engine, Sandbox};
use eryx_types::ToolDefinition;
use serde_json::json;

fn echo_def() -> ToolDefinition {
    ToolDefinition {
        name: "echo".to_string(),
        description: "echoes its input".into(),
        input_schema: json!({"type": "object"}),
    }
}

/// Scenario 3 (spec §8): a guest calls `invoke("echo", ...)`, observes
/// `Pending`, then cooperatively polls `host_poll` until the host
/// resolves the promise. Exercises `host_call`/`host_poll` exactly as
/// a real guest runtime would, proving the `Dispatcher`/`AsyncScheduler`
/// wiring end-to-end rather than through direct unit calls.
///
/// Request/response byte offsets and lengths below are computed by
/// hand against the exact JSON the host produces; the scheduler's
/// first-issued waitable/promise ids are hardcoded as `1` since this
/// guest is the only caller of a freshly built `AsyncScheduler`.
const INVOKE_ECHO_WAT: &str = r#"
    (module
        (import "eryx" "host_call" (func $host_call (param i32 i32) (result i64)))
        (import "eryx" "host_poll" (func $host_poll (param i64) (result i64)))
        (import "eryx" "host_log" (func $host_log (param i32 i32 i32)))
        (memory (export "memory") 64)
        (data (i32.const 0) "{\"method\":\"waitable_set_new\"}")
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
            (local $poll_result i64)
            (local $poll_len i32)
            (local $poll_ptr i32)
            (local $i i32)

            ;; waitable_set_new -- first id issued is always 1.
            (drop (call $host_call (i32.const 0) (i32.const 29)))
            ;; invoke("echo", {}) against that waitable set.
            (drop (call $host_call (i32.const 128) (i32.const 70)))

            ;; Cooperatively poll until the promise resolves -- an
            ;; empty completions array serializes to exactly 18 bytes.
            (local.set $i (i32.const 0))
            (block $done
                (loop $poll_loop
                    (local.set $poll_result (call $host_poll (i64.const 1)))
                    (local.set $poll_len
                        (i32.wrap_i64 (i64.and (local.get $poll_result) (i64.const 0xFFFFFFFF))))
                    (br_if $done (i32.ne (local.get $poll_len) (i32.const 18)))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br_if $poll_loop (i32.lt_u (local.get $i) (i32.const 200000)))
                )
            )
            (local.set $poll_ptr
                (i32.wrap_i64 (i64.shr_u (local.get $poll_result) (i64.const 32))))
            (call $host_log (i32.const 0) (local.get $poll_ptr) (local.get $poll_len))

            (i64.or (i64.shl (i64.const 512) (i64.const 32)) (i64.const 15))
        )

        (func (export "snapshot_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
        (func (export "restore_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
        (func (export "clear_state") (param $ptr i32) (param $len i32) (result i64) (i64.const 0))
    )
"#;

#[tokio::test]
async fn invoke_goes_pending_then_resolves_through_host_poll() {
    let engine = Arc::new(Engine::compile(INVOKE_ECHO_WAT.as_bytes()).expect("compiles"));
    let sandbox = Sandbox::builder(engine)
        .callback(Callback::new(echo_def(), |args| async move { Ok(args) }))
        .unwrap()
        .build()
        .unwrap();

    let result = sandbox.execute("ignored").await.unwrap();

    assert_eq!(
        result.stdout,
        r#"{"completions":[{"promise_id":1,"result":{},"status":"ok"}]}"#
    );
    assert_eq!(result.callback_count, 1);
}
