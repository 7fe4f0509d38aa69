//! Callback Registry — the guest's closed, frozen set of host callables.
//!
//! Grounded on the teacher's capability dispatch table in
//! `host_functions::dispatch`, generalized from a fixed method-name
//! match into an open registry of named handlers so tool-server proxies
//! (`eryx_mcp`) and caller-supplied callbacks share one lookup path.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use eryx_types::{EryxResult, ToolDefinition};
use serde_json::Value;

/// Result of a callback invocation as seen by the dispatcher: either a
/// JSON value the guest receives as `Ok(result)`, or an error string
/// the guest receives as `Err(message)` (spec §4.7, §9 — callback
/// errors travel as data, never as host-language exceptions).
pub type CallbackOutcome = Result<Value, String>;

type BoxFuture<'a> = Pin<Box<dyn Future<Output = CallbackOutcome> + Send + 'a>>;

/// A host-side callable exposed to the guest by name.
///
/// `handler` is boxed so both plain closures and tool-server proxies
/// (which need to borrow a shared `ToolServerManager`) can implement
/// it uniformly.
pub struct Callback {
    pub definition: ToolDefinition,
    handler: Arc<dyn Fn(Value) -> BoxFuture<'static> + Send + Sync>,
}

impl Callback {
    pub fn new<F, Fut>(definition: ToolDefinition, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackOutcome> + Send + 'static,
    {
        Self {
            definition,
            handler: Arc::new(move |args| Box::pin(handler(args))),
        }
    }

    pub async fn call(&self, args: Value) -> CallbackOutcome {
        (self.handler)(args).await
    }

    /// A cheap `Arc` clone of the handler, detached from `self`'s
    /// borrow — lets a spawned task own a callable without holding a
    /// reference into the registry.
    pub fn handler_handle(&self) -> Arc<dyn Fn(Value) -> BoxFuture<'static> + Send + Sync> {
        self.handler.clone()
    }
}

impl Clone for Callback {
    /// Cheap: the handler is already behind an `Arc`. Lets a `Factory`
    /// hold one baseline set of callbacks and hand each `Sandbox`/
    /// `Session` it stamps out its own registered copy (spec §4.13).
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl std::fmt::Debug for Callback {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callback")
            .field("name", &self.definition.name)
            .finish()
    }
}

/// Names reserved for built-in services (spec §4.2); caller-supplied
/// callbacks may not shadow them.
pub const BUILTIN_NAMES: &[&str] = &[
    "invoke",
    "list_callbacks",
    "report_trace",
    "snapshot_state",
    "restore_state",
    "clear_state",
];

/// Builder-time registry of callbacks. Frozen into an `Arc` once a
/// `Sandbox`/`Session` instance is built, so no mutation can reach a
/// running guest (spec §4.2: "immutable once a sandbox instance is
/// created — prevents privilege escalation mid-run").
#[derive(Default)]
pub struct CallbackRegistryBuilder {
    callbacks: HashMap<String, Callback>,
}

impl CallbackRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback. Errors if the name is already taken or
    /// collides with a built-in service name.
    pub fn register(&mut self, callback: Callback) -> EryxResult<()> {
        let name = callback.definition.name.clone();
        if BUILTIN_NAMES.contains(&name.as_str()) {
            return Err(eryx_types::EryxError::Initialization(format!(
                "callback name '{name}' is reserved for a built-in service"
            )));
        }
        if self.callbacks.contains_key(&name) {
            return Err(eryx_types::EryxError::Initialization(format!(
                "callback '{name}' already registered"
            )));
        }
        self.callbacks.insert(name, callback);
        Ok(())
    }

    pub fn freeze(self) -> CallbackRegistry {
        CallbackRegistry {
            callbacks: Arc::new(self.callbacks),
        }
    }
}

/// Immutable, shareable view of the registered callbacks. Safe to
/// clone across `Sandbox` clones produced by one `Factory` (spec §5).
#[derive(Clone)]
pub struct CallbackRegistry {
    callbacks: Arc<HashMap<String, Callback>>,
}

impl CallbackRegistry {
    pub fn lookup(&self, name: &str) -> Option<&Callback> {
        self.callbacks.get(name)
    }

    pub fn list(&self) -> Vec<&ToolDefinition> {
        self.callbacks.values().map(|c| &c.definition).collect()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_def(name: &str) -> ToolDefinition {
        ToolDefinition {
            name: name.to_string(),
            description: "echoes its input".into(),
            input_schema: json!({"type": "object"}),
        }
    }

    #[tokio::test]
    async fn register_lookup_and_call_roundtrip() {
        let mut builder = CallbackRegistryBuilder::new();
        builder
            .register(Callback::new(echo_def("echo"), |args| async move {
                Ok(args)
            }))
            .unwrap();
        let registry = builder.freeze();
        let cb = registry.lookup("echo").expect("registered");
        let out = cb.call(json!({"message": "ok"})).await.unwrap();
        assert_eq!(out, json!({"message": "ok"}));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let mut builder = CallbackRegistryBuilder::new();
        builder
            .register(Callback::new(echo_def("echo"), |a| async move { Ok(a) }))
            .unwrap();
        let err = builder
            .register(Callback::new(echo_def("echo"), |a| async move { Ok(a) }))
            .unwrap_err();
        assert_eq!(err.kind_name(), "initialization");
    }

    #[test]
    fn builtin_name_rejected() {
        let mut builder = CallbackRegistryBuilder::new();
        let err = builder
            .register(Callback::new(echo_def("invoke"), |a| async move { Ok(a) }))
            .unwrap_err();
        assert_eq!(err.kind_name(), "initialization");
    }

    #[test]
    fn list_reflects_registered_names() {
        let mut builder = CallbackRegistryBuilder::new();
        builder
            .register(Callback::new(echo_def("a"), |a| async move { Ok(a) }))
            .unwrap();
        builder
            .register(Callback::new(echo_def("b"), |a| async move { Ok(a) }))
            .unwrap();
        let registry = builder.freeze();
        let mut names: Vec<_> = registry.list().into_iter().map(|d| d.name.clone()).collect();
        names.sort();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }
}
