//! Read side of the cluster.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;

use crate::{BatchSandbox, LabelSelector, Pool};

/// Informer-backed read cache.
///
/// Reads are cheap, never fail and may lag the authoritative store. The
/// returned objects are shared snapshots and must not be mutated; clone
/// before building an update.
pub trait ResourceCache: Send + Sync + 'static {
    fn get_pool(&self, namespace: &str, name: &str) -> Option<Arc<Pool>>;

    fn get_batch_sandbox(&self, namespace: &str, name: &str) -> Option<Arc<BatchSandbox>>;

    fn list_batch_sandboxes(&self, namespace: &str) -> Vec<Arc<BatchSandbox>>;

    fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Vec<Arc<Pod>>;
}
