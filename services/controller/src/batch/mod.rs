//! BatchSandbox reconciliation.
//!
//! Pooled replicas are pool-owned pods claimed through the assigned-to
//! label; direct replicas are pods named `<batch>-<ordinal>` owned by the
//! BatchSandbox itself. Either way, each pass assigns ordinals from the
//! observed pods, disposes of the excess, fills the holes and writes the
//! replica status the proxy layer routes on.

mod assign;
mod reconciler;

pub use assign::{assign_ordinals, Assignment};
pub use reconciler::{BatchReconciler, DEFAULT_POOL_RETRY};
