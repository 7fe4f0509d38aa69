//! Async Scheduler — host-side completion plumbing behind the guest's
//! cooperative polling loop (spec §4.8).
//!
//! A waitable set is a handle to a multi-producer/single-consumer
//! completion channel; a promise is a one-shot slot a host sub-task
//! writes into exactly once. `invoke_async` acquires a `(waitable_id,
//! promise_id)` pair, spawns a host task to run the callback, and the
//! task's completion is what the guest observes on its next poll.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use eryx_types::{EryxError, EryxResult};
use serde_json::Value;
use tokio::sync::{mpsc, Notify};

pub type WaitableId = u64;
pub type PromiseId = u64;

/// What a promise resolved to, once its backing task completes.
#[derive(Debug, Clone)]
pub enum Completion {
    Ok(Value),
    Err(String),
}

struct PendingPromise {
    waitable_id: WaitableId,
    cancel: Arc<Notify>,
    cancelled: Arc<AtomicBool>,
}

/// One waitable set: the guest creates these to group promises it
/// wants to poll together (mirrors wasi's `waitable-set` in the
/// Component Model async ABI).
struct WaitableSet {
    tx: mpsc::UnboundedSender<(PromiseId, Completion)>,
    rx: mpsc::UnboundedReceiver<(PromiseId, Completion)>,
}

/// Host-side scheduler instance, one per running guest.
pub struct AsyncScheduler {
    next_waitable: AtomicU64,
    next_promise: AtomicU64,
    sets: std::sync::Mutex<HashMap<WaitableId, WaitableSet>>,
    pending: std::sync::Mutex<HashMap<PromiseId, PendingPromise>>,
    max_callbacks: Option<u64>,
    callback_count: AtomicU64,
    accepting: AtomicBool,
    /// Set once `acquire` rejects a call for exceeding `max_callbacks`.
    /// A guest can catch and swallow the `DispatchOutcome::Err` this
    /// produces, so the caller checks this flag after `execute()`
    /// finishes and upgrades an apparently-successful run to a
    /// `ResourceLimit` error (spec §4.8/§7: ceiling hits are
    /// caller-surfaced, not just guest-recoverable).
    ceiling_hit: AtomicBool,
}

impl AsyncScheduler {
    pub fn new(max_callbacks: Option<u64>) -> Self {
        Self {
            next_waitable: AtomicU64::new(1),
            next_promise: AtomicU64::new(1),
            sets: std::sync::Mutex::new(HashMap::new()),
            pending: std::sync::Mutex::new(HashMap::new()),
            max_callbacks,
            callback_count: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
            ceiling_hit: AtomicBool::new(false),
        }
    }

    pub fn callback_count(&self) -> u64 {
        self.callback_count.load(Ordering::Relaxed)
    }

    /// Whether any `invoke` during this run was rejected for exceeding
    /// `max_callbacks`, regardless of whether the guest itself went on
    /// to report success.
    pub fn ceiling_hit(&self) -> bool {
        self.ceiling_hit.load(Ordering::Relaxed)
    }

    /// `waitable_set_new` — guest asks for a new completion channel.
    pub fn waitable_set_new(&self) -> WaitableId {
        let id = self.next_waitable.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sets.lock().unwrap().insert(id, WaitableSet { tx, rx });
        id
    }

    /// `waitable_set_drop` — guest is done with a set. Any promises
    /// still joined to it are left orphaned (their completions are
    /// simply never observed); this is the guest's own bookkeeping
    /// error, not a host fault.
    pub fn waitable_set_drop(&self, id: WaitableId) {
        self.sets.lock().unwrap().remove(&id);
    }

    /// Reserve a fresh `(waitable_id, promise_id)` pair for an
    /// `invoke_async` call, gated against the callback-count ceiling
    /// (spec §5: "gated against the ceiling before issuing the pending
    /// tuple").
    pub fn acquire(&self, waitable_id: WaitableId) -> EryxResult<(PromiseId, Arc<AtomicBool>)> {
        if !self.accepting.load(Ordering::Relaxed) {
            return Err(EryxError::Timeout {
                kind: eryx_types::TimeoutKind::Execution,
                elapsed_ms: 0,
            });
        }
        let count = self.callback_count.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(max) = self.max_callbacks {
            if count > max {
                self.ceiling_hit.store(true, Ordering::Relaxed);
                return Err(EryxError::ResourceLimit(format!(
                    "callback invocation ceiling ({max}) exceeded"
                )));
            }
        }
        let promise_id = self.next_promise.fetch_add(1, Ordering::Relaxed);
        let cancelled = Arc::new(AtomicBool::new(false));
        self.pending.lock().unwrap().insert(
            promise_id,
            PendingPromise {
                waitable_id,
                cancel: Arc::new(Notify::new()),
                cancelled: cancelled.clone(),
            },
        );
        Ok((promise_id, cancelled))
    }

    /// `context_set`/`context_get`-backed resolution path: a host task
    /// finished running the callback and posts the result into the
    /// promise's waitable set.
    pub fn resolve(&self, promise_id: PromiseId, completion: Completion) {
        let waitable_id = {
            let mut pending = self.pending.lock().unwrap();
            match pending.remove(&promise_id) {
                Some(p) => p.waitable_id,
                None => return, // already cancelled/dropped
            }
        };
        let sets = self.sets.lock().unwrap();
        if let Some(set) = sets.get(&waitable_id) {
            let _ = set.tx.send((promise_id, completion));
        }
    }

    /// `subtask_drop` — guest discards a promise without ever having
    /// polled it.
    pub fn subtask_drop(&self, promise_id: PromiseId) {
        self.pending.lock().unwrap().remove(&promise_id);
    }

    /// Single-threaded polling sweep: drain every completion currently
    /// queued on `waitable_id`, in the order the host resolved them
    /// (spec §4.8 ordering guarantee — resolution order, not issue
    /// order).
    pub fn poll(&self, waitable_id: WaitableId) -> Vec<(PromiseId, Completion)> {
        let mut sets = self.sets.lock().unwrap();
        let Some(set) = sets.get_mut(&waitable_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while let Ok(item) = set.rx.try_recv() {
            out.push(item);
        }
        out
    }

    /// Refuse new `invoke` acquisitions (execution timeout / caller
    /// cancel, spec §4.8 cancellation step (a)).
    pub fn stop_accepting(&self) {
        self.accepting.store(false, Ordering::Relaxed);
    }

    /// Cooperatively cancel every in-flight sub-task (step (b)): each
    /// handler observes `cancelled` and should stop promptly; the host
    /// does not force-kill the task here, it only signals.
    pub fn cancel_all(&self) {
        let pending = self.pending.lock().unwrap();
        for p in pending.values() {
            p.cancelled.store(true, Ordering::Relaxed);
            p.cancel.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_then_resolve_delivers_in_resolution_order() {
        let sched = AsyncScheduler::new(None);
        let set = sched.waitable_set_new();
        let (p1, _) = sched.acquire(set).unwrap();
        let (p2, _) = sched.acquire(set).unwrap();

        // Resolve p2 before p1 — the guest should observe p2 first.
        sched.resolve(p2, Completion::Ok(Value::from(2)));
        sched.resolve(p1, Completion::Ok(Value::from(1)));

        let completions = sched.poll(set);
        assert_eq!(completions.len(), 2);
        assert_eq!(completions[0].0, p2);
        assert_eq!(completions[1].0, p1);
    }

    #[test]
    fn max_callbacks_ceiling_enforced() {
        let sched = AsyncScheduler::new(Some(1));
        let set = sched.waitable_set_new();
        sched.acquire(set).unwrap();
        assert!(!sched.ceiling_hit());
        let err = sched.acquire(set).unwrap_err();
        assert_eq!(err.kind_name(), "resource_limit");
        assert!(sched.ceiling_hit());
    }

    #[test]
    fn stop_accepting_rejects_new_acquisitions() {
        let sched = AsyncScheduler::new(None);
        let set = sched.waitable_set_new();
        sched.stop_accepting();
        let err = sched.acquire(set).unwrap_err();
        assert_eq!(err.kind_name(), "timeout");
    }

    #[test]
    fn each_promise_resolves_exactly_once() {
        let sched = AsyncScheduler::new(None);
        let set = sched.waitable_set_new();
        let (p1, _) = sched.acquire(set).unwrap();
        sched.resolve(p1, Completion::Ok(Value::Null));
        // Second resolve for the same id is a no-op (already removed).
        sched.resolve(p1, Completion::Ok(Value::Null));
        let completions = sched.poll(set);
        assert_eq!(completions.len(), 1);
    }

    #[test]
    fn waitable_set_drop_stops_future_polls() {
        let sched = AsyncScheduler::new(None);
        let set = sched.waitable_set_new();
        sched.waitable_set_drop(set);
        assert!(sched.poll(set).is_empty());
    }
}
