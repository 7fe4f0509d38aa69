//! WASM sandbox execution engine for running untrusted Python under
//! host-mediated capabilities.
//!
//! The guest never gets ambient authority: network access, filesystem
//! access, secrets, and long-running callbacks all cross the host
//! boundary through the `Dispatcher`, checked against the policy each
//! `Sandbox`/`Session` was built with. `Sandbox` is the single-use
//! entry point (fresh guest per call); `Session` reuses one guest
//! instance across calls and adds `snapshot_state`/`restore_state`.
//! `Factory` compiles a guest artifact once and stamps out either from
//! a shared baseline.

pub mod dispatcher;
pub mod engine;
pub mod executor;
pub mod factory;
pub mod guest;
pub mod io_pumps;
pub mod net_policy;
pub mod registry;
pub mod sandbox;
pub mod scheduler;
pub mod session;
pub mod snapshot;
pub mod vault;
pub mod vfs;

pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use engine::Engine;
pub use factory::Factory;
pub use io_pumps::Sink;
pub use net_policy::NetPolicy;
pub use registry::{Callback, CallbackRegistry, CallbackRegistryBuilder};
pub use sandbox::{Sandbox, SandboxBuilder};
pub use scheduler::AsyncScheduler;
pub use session::{Session, SessionBuilder};
pub use snapshot::SnapshotCodec;
pub use vault::SecretsVault;
pub use vfs::Vfs;

pub use eryx_types::{
    EryxError, EryxResult, ExecuteResult, NetConfig, ResourceLimits, Secret, ToolDefinition,
    VolumeMount,
};
