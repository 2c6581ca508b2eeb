//! Errors surfaced by the cluster mutation API.

use thiserror::Error;

/// Failures of a cluster write.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClusterError {
    /// The object changed since it was read (stale resourceVersion).
    #[error("conflict: {0}")]
    Conflict(String),

    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with the same name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The API server asked us to slow down.
    #[error("throttled: {0}")]
    Throttled(String),

    /// The API server rejected the object as invalid.
    #[error("invalid object: {0}")]
    Invalid(String),

    /// Any other API server response.
    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    /// The request never reached the API server.
    #[error("transport error: {0}")]
    Transport(String),
}

impl ClusterError {
    /// Returns true if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ClusterError::Invalid(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict(_))
    }
}
