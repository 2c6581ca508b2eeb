//! Shared harness for controller integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use sandbox_api::{labels, ResourceKind};
use sandbox_controller::batch::BatchReconciler;
use sandbox_controller::capacity::CapacityController;
use sandbox_controller::{ReconcileContext, Reconciler, Requeue};
use sandbox_testing::FakeCluster;

pub const NS: &str = "sandboxes";

pub struct Harness {
    pub cluster: FakeCluster,
    pub pools: CapacityController,
    pub batches: BatchReconciler,
    pub ctx: ReconcileContext,
}

impl Harness {
    pub fn new() -> Self {
        let cluster = FakeCluster::new();
        let shared = Arc::new(cluster.clone());
        Self {
            pools: CapacityController::new(shared.clone(), shared.clone()),
            batches: BatchReconciler::new(shared.clone(), shared)
                .with_pool_retry(Duration::from_secs(3)),
            cluster,
            ctx: ReconcileContext::detached(),
        }
    }

    pub async fn reconcile_pool(&self, name: &str) -> Requeue {
        self.pools.reconcile(NS, name, &self.ctx).await.unwrap()
    }

    pub async fn reconcile_batch(&self, name: &str) -> Requeue {
        self.batches.reconcile(NS, name, &self.ctx).await.unwrap()
    }

    /// Reconcile the pool until it settles, with every pod turning ready
    /// between passes.
    pub async fn converge_pool(&self, name: &str) {
        for _ in 0..6 {
            self.reconcile_pool(name).await;
            self.cluster.mark_all_ready(NS);
        }
    }

    pub fn pool_pods(&self, pool: &str) -> Vec<Pod> {
        self.cluster
            .pods(NS)
            .into_iter()
            .filter(|pod| labels::owner(pod) == Some((ResourceKind::Pool, pool)))
            .collect()
    }

    pub fn assigned_to(&self, batch: &str) -> Vec<Pod> {
        self.cluster
            .pods(NS)
            .into_iter()
            .filter(|pod| labels::assigned_to(pod) == Some(batch))
            .collect()
    }

    pub fn owned_by_batch(&self, batch: &str) -> Vec<Pod> {
        self.cluster
            .pods(NS)
            .into_iter()
            .filter(|pod| labels::owner(pod) == Some((ResourceKind::BatchSandbox, batch)))
            .collect()
    }
}

/// `(name, index)` pairs sorted by index.
pub fn ordinals(pods: &[Pod]) -> Vec<(String, Option<usize>)> {
    let mut pairs: Vec<(String, Option<usize>)> = pods
        .iter()
        .map(|pod| (labels::pod_name(pod).to_string(), labels::pod_index(pod)))
        .collect();
    pairs.sort_by_key(|(_, index)| *index);
    pairs
}
