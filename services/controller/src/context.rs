//! Per-pass context and the seam between the engine and its reconcilers.

use std::time::Duration;

use async_trait::async_trait;
use sandbox_api::Condition;
use tokio::sync::watch;

use crate::error::ControllerResult;

/// What the engine should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Converged, or waiting on an event that will enqueue the key again.
    Done,
    /// Look again after the delay even if nothing changes.
    After(Duration),
}

/// Shared state handed to every reconcile pass.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    shutdown: watch::Receiver<bool>,
}

impl ReconcileContext {
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self { shutdown }
    }

    /// A context that never observes shutdown.
    pub fn detached() -> Self {
        // The last value stays readable after the sender is gone.
        let (_tx, rx) = watch::channel(false);
        Self { shutdown: rx }
    }

    /// Shutdown was signalled; stop before the next intent.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }
}

/// One reconciler per resource kind.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Converge the named object. An absent object means it was deleted.
    async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        ctx: &ReconcileContext,
    ) -> ControllerResult<Requeue>;

    /// Attach a failure condition to the object's status. A missing object
    /// is not an error.
    async fn record_failure(
        &self,
        namespace: &str,
        name: &str,
        condition: Condition,
    ) -> ControllerResult<()>;
}
