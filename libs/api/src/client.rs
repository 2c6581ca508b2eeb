//! Write side of the cluster.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;

use crate::{BatchSandbox, BatchSandboxStatus, ClusterError, Pool, PoolStatus};

/// Guards a delete against an object that changed since it was read.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Preconditions {
    pub resource_version: Option<String>,
    pub uid: Option<String>,
}

impl Preconditions {
    /// Delete unconditionally.
    pub fn none() -> Self {
        Self::default()
    }

    /// Delete only the version of `pod` that was observed.
    pub fn observed(pod: &Pod) -> Self {
        Self {
            resource_version: pod.metadata.resource_version.clone(),
            uid: pod.metadata.uid.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.resource_version.is_none() && self.uid.is_none()
    }
}

/// Cluster mutation API.
///
/// Updates carry the resourceVersion of the object they were built from and
/// fail with [`ClusterError::Conflict`] when it is stale. Deletes fail the
/// same way when their preconditions no longer hold. Deleting an object that
/// is already gone succeeds.
#[async_trait]
pub trait ClusterClient: Send + Sync + 'static {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), ClusterError>;

    async fn update_pool_status(&self, pool: &Pool, status: &PoolStatus)
        -> Result<(), ClusterError>;

    async fn update_batch_sandbox_status(
        &self,
        batch_sandbox: &BatchSandbox,
        status: &BatchSandboxStatus,
    ) -> Result<(), ClusterError>;
}
