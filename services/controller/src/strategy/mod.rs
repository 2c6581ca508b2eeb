//! Per-BatchSandbox strategies.
//!
//! Each strategy is resolved once per reconcile pass by a pure
//! classification of the BatchSandbox. Resolvers return an enum naming the
//! selected variant, so callers dispatch on an explicit tag rather than
//! probing types, and new variants can be added without touching callers
//! that only use the capability traits.

mod pool;
mod task;

pub use pool::{resolve_pool_strategy, DefaultPoolStrategy, PoolStrategy, ResolvedPoolStrategy};
pub use task::{
    resolve_task_strategy, DefaultTaskSchedulingStrategy, ResolvedTaskStrategy,
    TaskGenerationError, TaskSchedulingStrategy,
};
