//! Pool control loop.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use sandbox_api::{
    condition_types, labels, remove_condition, set_condition, ClusterClient, Condition,
    ConditionStatus, ObjectKey, Pool, PoolStatus, Preconditions, ResourceCache, ResourceKind,
};
use tracing::{debug, info, instrument, warn};

use super::expectations::{Expectations, InFlight};
use super::planner::{self, CapacityPlan};
use crate::context::{ReconcileContext, Reconciler, Requeue};
use crate::error::{ControllerError, ControllerResult};
use crate::pods::{self, PodOwner};

/// Keeps every Pool's warm pod count inside its capacity bounds.
pub struct CapacityController {
    cache: Arc<dyn ResourceCache>,
    client: Arc<dyn ClusterClient>,
    expectations: Expectations,
}

impl CapacityController {
    pub fn new(cache: Arc<dyn ResourceCache>, client: Arc<dyn ClusterClient>) -> Self {
        Self::with_expectations(cache, client, Expectations::default())
    }

    pub fn with_expectations(
        cache: Arc<dyn ResourceCache>,
        client: Arc<dyn ClusterClient>,
        expectations: Expectations,
    ) -> Self {
        Self {
            cache,
            client,
            expectations,
        }
    }

    #[instrument(skip(self, pool, ctx), fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile_pool(
        &self,
        key: &ObjectKey,
        pool: &Pool,
        ctx: &ReconcileContext,
    ) -> ControllerResult<Requeue> {
        let capacity = pool.spec.capacity_spec;
        planner::validate(&capacity).map_err(|reason| ControllerError::InvalidCapacity {
            key: key.to_string(),
            reason,
        })?;

        let owned = self
            .cache
            .list_pods(&key.namespace, &labels::owned_by(ResourceKind::Pool, &key.name));
        let visible: Vec<&Pod> = owned.iter().map(|pod| pod.as_ref()).collect();
        let in_flight = self.expectations.observe(key, &visible);
        let live: Vec<&Pod> = visible
            .iter()
            .copied()
            .filter(|pod| {
                !labels::is_terminating(pod) && !in_flight.is_deleting(labels::pod_name(pod))
            })
            .collect();

        let template = pool.spec.template.as_ref();
        let hash = template.map(pods::template_hash);
        let plan = planner::plan(
            &capacity,
            &live,
            in_flight.creates.len(),
            hash.as_ref().map(|h| h.as_str()).unwrap_or_default(),
        );

        debug!(
            total = plan.counts.total,
            available = plan.counts.available,
            starting = plan.counts.starting,
            allocated = plan.counts.allocated,
            create = plan.create,
            delete = plan.delete.len(),
            "Pool capacity plan"
        );

        if plan.create > 0 {
            let (Some(template), Some(hash)) = (template, hash.as_ref()) else {
                return Err(ControllerError::MissingTemplate {
                    key: key.to_string(),
                    what: "pool",
                });
            };
            let mut taken: HashSet<String> = visible
                .iter()
                .map(|pod| labels::pod_name(pod).to_string())
                .collect();
            taken.extend(in_flight.creates.iter().cloned());

            let owner = PodOwner {
                kind: ResourceKind::Pool,
                name: &key.name,
                reference: pool.controller_owner_ref(&()),
            };
            for name in planner::pod_names(&key.name, hash.short(), &taken, plan.create) {
                if ctx.is_shutdown() {
                    return Ok(Requeue::Done);
                }
                let pod = pods::pod_from_template(template, &key.namespace, &name, &owner, hash);
                self.create_pod(key, &pod).await?;
            }
        }

        for victim in &plan.delete {
            if ctx.is_shutdown() {
                return Ok(Requeue::Done);
            }
            let preconditions = live
                .iter()
                .find(|pod| labels::pod_name(pod) == victim.as_str())
                .map(|pod| Preconditions::observed(pod))
                .unwrap_or_default();
            self.delete_pod(key, victim, &preconditions).await?;
        }

        self.write_status(pool, status_for(pool, &plan, &in_flight))
            .await?;
        Ok(Requeue::Done)
    }

    async fn create_pod(&self, key: &ObjectKey, pod: &Pod) -> ControllerResult<()> {
        let name = labels::pod_name(pod);
        self.expectations.expect_create(key, name);
        match self.client.create_pod(pod).await {
            Ok(_) => {
                info!(pod = %name, "Created pool pod");
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(pod = %name, "Pool pod already exists");
                Ok(())
            }
            Err(e) => {
                self.expectations.cancel_create(key, name);
                warn!(pod = %name, error = %e, "Failed to create pool pod");
                Err(e.into())
            }
        }
    }

    async fn delete_pod(
        &self,
        key: &ObjectKey,
        name: &str,
        preconditions: &Preconditions,
    ) -> ControllerResult<()> {
        self.expectations.expect_delete(key, name);
        match self.client.delete_pod(&key.namespace, name, preconditions).await {
            Ok(()) => {
                info!(pod = %name, "Deleted pool pod");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            // Claimed or replaced since the cache saw it; the next pass re-plans.
            Err(e) if e.is_conflict() => {
                self.expectations.cancel_delete(key, name);
                debug!(pod = %name, error = %e, "Victim changed, skipping delete");
                Ok(())
            }
            Err(e) => {
                self.expectations.cancel_delete(key, name);
                warn!(pod = %name, error = %e, "Failed to delete pool pod");
                Err(e.into())
            }
        }
    }

    /// The pool is gone: delete every pod it owns.
    #[instrument(skip(self, ctx), fields(namespace = %key.namespace, name = %key.name))]
    async fn cleanup(&self, key: &ObjectKey, ctx: &ReconcileContext) -> ControllerResult<Requeue> {
        let owned = self
            .cache
            .list_pods(&key.namespace, &labels::owned_by(ResourceKind::Pool, &key.name));
        for pod in owned.iter().filter(|pod| !labels::is_terminating(pod)) {
            if ctx.is_shutdown() {
                return Ok(Requeue::Done);
            }
            self.delete_pod(key, labels::pod_name(pod), &Preconditions::none())
                .await?;
        }
        self.expectations.forget(key);
        info!(pods = owned.len(), "Cleaned up deleted pool");
        Ok(Requeue::Done)
    }

    async fn write_status(&self, pool: &Pool, status: PoolStatus) -> ControllerResult<()> {
        if pool.status.as_ref() == Some(&status) {
            return Ok(());
        }
        match self.client.update_pool_status(pool, &status).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn status_for(pool: &Pool, plan: &CapacityPlan, in_flight: &InFlight) -> PoolStatus {
    let mut status = pool.status.clone().unwrap_or_default();
    status.observed_generation = pool.metadata.generation;
    status.total = plan.counts.total as i32;
    status.allocated = plan.counts.allocated as i32;
    status.available = plan.counts.available as i32;
    status.total_ready = plan.counts.ready as i32;
    status.total_desired = plan.total_desired() as i32;

    remove_condition(&mut status.conditions, condition_types::INVALID_CAPACITY);
    remove_condition(&mut status.conditions, condition_types::RECONCILE_FAILED);
    let settled = plan.is_noop()
        && plan.counts.starting == 0
        && in_flight.creates.is_empty()
        && in_flight.deletes.is_empty();
    let buffer_min = pool.spec.capacity_spec.buffer_min.max(0) as usize;
    let ready = if settled && plan.counts.available < buffer_min {
        Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "BufferCapped",
            format!(
                "pool is at poolMax with {} of {buffer_min} buffered pods",
                plan.counts.available
            ),
        )
    } else if settled {
        Condition::new(
            condition_types::READY,
            ConditionStatus::True,
            "Converged",
            "pool is within its capacity bounds",
        )
    } else {
        Condition::new(
            condition_types::READY,
            ConditionStatus::False,
            "Scaling",
            "pool is converging towards its capacity bounds",
        )
    };
    set_condition(&mut status.conditions, ready);
    status
}

#[async_trait]
impl Reconciler for CapacityController {
    async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        ctx: &ReconcileContext,
    ) -> ControllerResult<Requeue> {
        let key = ObjectKey::pool(namespace, name);
        match self.cache.get_pool(namespace, name) {
            Some(pool) => self.reconcile_pool(&key, &pool, ctx).await,
            None => self.cleanup(&key, ctx).await,
        }
    }

    async fn record_failure(
        &self,
        namespace: &str,
        name: &str,
        condition: Condition,
    ) -> ControllerResult<()> {
        let Some(pool) = self.cache.get_pool(namespace, name) else {
            return Ok(());
        };
        let mut status = pool.status.clone().unwrap_or_default();
        status.observed_generation = pool.metadata.generation;
        set_condition(
            &mut status.conditions,
            Condition::new(
                condition_types::READY,
                ConditionStatus::False,
                condition.reason.clone(),
                condition.message.clone(),
            ),
        );
        set_condition(&mut status.conditions, condition);
        self.write_status(&pool, status).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_api::CapacitySpec;
    use sandbox_testing::{fixtures, Action, FakeCluster, Op};

    fn controller(cluster: &FakeCluster) -> CapacityController {
        let cluster = Arc::new(cluster.clone());
        CapacityController::new(cluster.clone(), cluster)
    }

    #[tokio::test]
    async fn test_creates_named_pods_with_owner_reference() {
        let cluster = FakeCluster::new();
        cluster.apply_pool(fixtures::pool("ns", "warm", CapacitySpec::new(0, 5, 2, 3)));

        controller(&cluster)
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap();

        let pods = cluster.pods("ns");
        assert_eq!(pods.len(), 2);
        for (n, pod) in pods.iter().enumerate() {
            let name = labels::pod_name(pod);
            assert!(name.starts_with("warm-"), "{name}");
            assert!(name.ends_with(&format!("-{n}")), "{name}");
            assert_eq!(labels::owner(pod), Some((ResourceKind::Pool, "warm")));
            let refs = pod.metadata.owner_references.as_ref().unwrap();
            assert_eq!(refs[0].kind, "Pool");
            assert_eq!(refs[0].controller, Some(true));
        }
    }

    #[tokio::test]
    async fn test_second_pass_over_stale_cache_emits_nothing() {
        let cluster = FakeCluster::new();
        cluster.apply_pool(fixtures::pool("ns", "warm", CapacitySpec::new(0, 5, 2, 3)));
        cluster.freeze_cache();
        let controller = controller(&cluster);

        controller
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap();
        cluster.clear_actions();
        controller
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap();

        assert!(cluster
            .actions()
            .iter()
            .all(|a| !matches!(a, Action::CreatePod(_) | Action::DeletePod(_))));
        assert_eq!(cluster.pods("ns").len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_capacity_refuses_to_act() {
        let cluster = FakeCluster::new();
        cluster.apply_pool(fixtures::pool("ns", "warm", CapacitySpec::new(3, 1, 0, 1)));

        let err = controller(&cluster)
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, ControllerError::InvalidCapacity { .. }));
        assert!(!err.is_transient());
        assert!(cluster.actions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_create_is_retried_next_pass() {
        let cluster = FakeCluster::new();
        cluster.apply_pool(fixtures::pool("ns", "warm", CapacitySpec::new(1, 1, 0, 1)));
        cluster.fail_next(Op::CreatePod, sandbox_api::ClusterError::Throttled("busy".into()));
        let controller = controller(&cluster);

        let err = controller
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(cluster.pods("ns").is_empty());

        controller
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap();
        assert_eq!(cluster.pods("ns").len(), 1);
    }

    #[tokio::test]
    async fn test_status_reports_counts() {
        let cluster = FakeCluster::new();
        cluster.apply_pool(fixtures::pool("ns", "warm", CapacitySpec::new(0, 5, 1, 2)));
        cluster.apply_pod(fixtures::pool_pod("ns", "warm-x-0", "warm", true));
        cluster.apply_pod(fixtures::assigned_pod("ns", "warm-x-1", "warm", "bs", Some(0)));

        controller(&cluster)
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap();

        let status = cluster.pool_status("ns", "warm").unwrap();
        assert_eq!(status.total, 2);
        assert_eq!(status.allocated, 1);
        assert_eq!(status.available, 1);
        assert_eq!(status.total_ready, 2);
        assert_eq!(status.total_desired, 2);
        assert_eq!(status.observed_generation, Some(1));
        let ready = status
            .conditions
            .iter()
            .find(|c| c.type_ == condition_types::READY)
            .unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
    }

    #[tokio::test]
    async fn test_deleted_pool_removes_owned_pods() {
        let cluster = FakeCluster::new();
        cluster.apply_pod(fixtures::pool_pod("ns", "warm-x-0", "warm", true));
        cluster.apply_pod(fixtures::pool_pod("ns", "other-x-0", "other", true));

        controller(&cluster)
            .reconcile("ns", "warm", &ReconcileContext::detached())
            .await
            .unwrap();

        let names: Vec<String> = cluster
            .pods("ns")
            .iter()
            .map(|p| labels::pod_name(p).to_string())
            .collect();
        assert_eq!(names, ["other-x-0"]);
    }
}
