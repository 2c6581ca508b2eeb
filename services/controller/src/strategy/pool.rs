//! Pooled vs direct classification.

use sandbox_api::BatchSandbox;

/// Capability exposed by every pool strategy variant.
pub trait PoolStrategy {
    /// True when replicas are borrowed from a Pool rather than created
    /// from an inline template.
    fn is_pooled_mode(&self) -> bool;

    /// The pool replicas are borrowed from, in pooled mode.
    fn pool_ref(&self) -> Option<&str>;
}

/// Pooled iff the BatchSandbox carries no inline template.
#[derive(Debug, Clone, Copy)]
pub struct DefaultPoolStrategy<'a> {
    batch_sandbox: &'a BatchSandbox,
}

impl<'a> DefaultPoolStrategy<'a> {
    pub fn new(batch_sandbox: &'a BatchSandbox) -> Self {
        Self { batch_sandbox }
    }
}

impl PoolStrategy for DefaultPoolStrategy<'_> {
    fn is_pooled_mode(&self) -> bool {
        self.batch_sandbox.spec.template.is_none()
    }

    fn pool_ref(&self) -> Option<&str> {
        if !self.is_pooled_mode() {
            return None;
        }
        self.batch_sandbox
            .spec
            .pool_ref
            .as_deref()
            .filter(|name| !name.is_empty())
    }
}

/// The strategy variant selected for a BatchSandbox.
#[derive(Debug, Clone, Copy)]
#[non_exhaustive]
pub enum ResolvedPoolStrategy<'a> {
    Default(DefaultPoolStrategy<'a>),
}

impl ResolvedPoolStrategy<'_> {
    pub fn variant(&self) -> &'static str {
        match self {
            ResolvedPoolStrategy::Default(_) => "default",
        }
    }
}

impl PoolStrategy for ResolvedPoolStrategy<'_> {
    fn is_pooled_mode(&self) -> bool {
        match self {
            ResolvedPoolStrategy::Default(s) => s.is_pooled_mode(),
        }
    }

    fn pool_ref(&self) -> Option<&str> {
        match self {
            ResolvedPoolStrategy::Default(s) => s.pool_ref(),
        }
    }
}

/// Select the pool strategy for a BatchSandbox.
///
/// Total over every BatchSandbox: objects without any selection labels get
/// the default variant.
pub fn resolve_pool_strategy(batch_sandbox: &BatchSandbox) -> ResolvedPoolStrategy<'_> {
    ResolvedPoolStrategy::Default(DefaultPoolStrategy::new(batch_sandbox))
}
