//! Controller error taxonomy.

use sandbox_api::ClusterError;
use sandbox_reconcile::PatchError;
use thiserror::Error;

use crate::strategy::TaskGenerationError;

/// Result type for reconciliation.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors that can occur while reconciling a key.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A cluster write failed.
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// A shard task patch could not be applied.
    #[error("{key}: failed to merge shard task patch {patch} at index {index}: {source}")]
    TaskPatch {
        key: String,
        index: usize,
        patch: String,
        #[source]
        source: PatchError,
    },

    /// The pool's capacity bounds contradict each other.
    #[error("{key}: invalid capacity: {reason}")]
    InvalidCapacity { key: String, reason: String },

    /// A required template is absent.
    #[error("{key}: {what} has no pod template")]
    MissingTemplate { key: String, what: &'static str },

    /// The task could not be encoded for the executor.
    #[error("{key}: failed to encode task: {reason}")]
    Encode { key: String, reason: String },
}

impl ControllerError {
    pub fn task_patch(key: impl Into<String>, err: TaskGenerationError) -> Self {
        ControllerError::TaskPatch {
            key: key.into(),
            index: err.index,
            patch: err.patch,
            source: err.source,
        }
    }

    /// Returns true if the queue should retry the key with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ControllerError::Cluster(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Status condition type recorded for a permanent failure.
    pub fn condition_type(&self) -> &'static str {
        use sandbox_api::condition_types::*;
        match self {
            ControllerError::TaskPatch { .. } => TASK_GENERATION_FAILED,
            ControllerError::InvalidCapacity { .. } => INVALID_CAPACITY,
            _ => RECONCILE_FAILED,
        }
    }

    /// Short CamelCase reason for status conditions.
    pub fn reason(&self) -> &'static str {
        match self {
            ControllerError::Cluster(_) => "ClusterError",
            ControllerError::TaskPatch { .. } => "PatchFailed",
            ControllerError::InvalidCapacity { .. } => "InvalidCapacity",
            ControllerError::MissingTemplate { .. } => "MissingTemplate",
            ControllerError::Encode { .. } => "EncodeFailed",
        }
    }
}
