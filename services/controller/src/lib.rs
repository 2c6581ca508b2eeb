//! Sandbox controller library.
//!
//! Reconciles Pools (warm pod buffers) and BatchSandboxes (replica sets
//! drawn from a pool or created directly) against a cluster. The crate ships
//! the `sandbox-controller` binary; the library surface exists so the engine
//! can be driven against an in-memory cluster in tests.

pub mod backend;
pub mod batch;
pub mod capacity;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod ordering;
pub mod pods;
pub mod strategy;

pub use context::{ReconcileContext, Reconciler, Requeue};
pub use engine::{EngineConfig, ReconcileEngine, WorkQueue};
pub use error::{ControllerError, ControllerResult};
