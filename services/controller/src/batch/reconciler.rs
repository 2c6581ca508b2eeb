//! BatchSandbox control loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::Resource;
use sandbox_api::{
    condition_types, labels, remove_condition, set_condition, BatchSandbox, BatchSandboxStatus,
    ClusterClient, Condition, ConditionStatus, LabelSelector, ObjectKey, Preconditions,
    ReplicaStatus, ResourceCache, ResourceKind,
};
use tracing::{debug, info, instrument, warn};

use super::assign::assign_ordinals;
use crate::context::{ReconcileContext, Reconciler, Requeue};
use crate::error::{ControllerError, ControllerResult};
use crate::ordering::MultiPodSorter;
use crate::pods::{self, PodOwner};
use crate::strategy::{
    resolve_pool_strategy, resolve_task_strategy, PoolStrategy, TaskSchedulingStrategy,
};

/// Default delay before retrying a BatchSandbox whose pool is short.
pub const DEFAULT_POOL_RETRY: Duration = Duration::from_secs(5);

/// Outcome of filling missing ordinals.
#[derive(Debug, Default)]
struct Fill {
    /// Pods now serving a previously missing ordinal.
    placed: Vec<(usize, Pod)>,
    /// Ordinals that are still missing.
    shortage: usize,
    /// Why the pool could not serve, when it could not.
    unavailable: Option<String>,
}

/// Keeps every BatchSandbox's replica set converged.
pub struct BatchReconciler {
    cache: Arc<dyn ResourceCache>,
    client: Arc<dyn ClusterClient>,
    pool_retry: Duration,
}

impl BatchReconciler {
    pub fn new(cache: Arc<dyn ResourceCache>, client: Arc<dyn ClusterClient>) -> Self {
        Self {
            cache,
            client,
            pool_retry: DEFAULT_POOL_RETRY,
        }
    }

    /// Delay before looking again at a BatchSandbox whose pool is short.
    pub fn with_pool_retry(mut self, pool_retry: Duration) -> Self {
        self.pool_retry = pool_retry;
        self
    }

    fn live_pods(&self, namespace: &str, selector: &LabelSelector) -> Vec<Arc<Pod>> {
        self.cache
            .list_pods(namespace, selector)
            .into_iter()
            .filter(|pod| !labels::is_terminating(pod))
            .collect()
    }

    #[instrument(skip(self, bs, ctx), fields(namespace = %key.namespace, name = %key.name))]
    async fn reconcile_batch(
        &self,
        key: &ObjectKey,
        bs: &BatchSandbox,
        ctx: &ReconcileContext,
    ) -> ControllerResult<Requeue> {
        let pool_strategy = resolve_pool_strategy(bs);
        let task_strategy = resolve_task_strategy(bs);
        let replicas = bs.replicas();

        let tasks = if task_strategy.need_task_scheduling() {
            let tasks = task_strategy.generate_task_specs().map_err(|e| {
                warn!(
                    index = e.index,
                    generated = e.partial.len(),
                    error = %e.source,
                    "Task generation failed"
                );
                ControllerError::task_patch(key.to_string(), e)
            })?;
            tasks
                .iter()
                .map(|task| {
                    pods::encode_task(task)
                        .map(Some)
                        .map_err(|e| ControllerError::Encode {
                            key: key.to_string(),
                            reason: e.to_string(),
                        })
                })
                .collect::<ControllerResult<Vec<_>>>()?
        } else {
            vec![None; replicas]
        };
        let task_for = |index: usize| tasks.get(index).cloned().flatten();

        let pooled = pool_strategy.is_pooled_mode();
        let pool_ref = pool_strategy.pool_ref();
        let assigned = self.live_pods(&key.namespace, &labels::assigned_to_selector(&key.name));
        let direct = self.live_pods(
            &key.namespace,
            &labels::owned_by(ResourceKind::BatchSandbox, &key.name),
        );

        // Pods that belong to the other mode are always excess.
        let (members, mut foreign): (Vec<&Pod>, Vec<&Pod>) = if pooled {
            let (members, stale): (Vec<&Pod>, Vec<&Pod>) = assigned
                .iter()
                .map(|pod| pod.as_ref())
                .partition(|pod| {
                    pool_ref.is_some_and(|pool| {
                        labels::owner(pod) == Some((ResourceKind::Pool, pool))
                    })
                });
            let mut foreign = stale;
            foreign.extend(direct.iter().map(|pod| pod.as_ref()));
            (members, foreign)
        } else {
            (
                direct.iter().map(|pod| pod.as_ref()).collect(),
                assigned.iter().map(|pod| pod.as_ref()).collect(),
            )
        };

        let assignment = assign_ordinals(&members, replicas);
        foreign.extend(assignment.excess.iter().copied());

        debug!(
            strategy = pool_strategy.variant(),
            mode = if pooled { "pooled" } else { "direct" },
            replicas,
            members = members.len(),
            excess = foreign.len(),
            missing = assignment.missing().len(),
            "BatchSandbox assignment"
        );

        for pod in foreign {
            if ctx.is_shutdown() {
                return Ok(Requeue::Done);
            }
            self.dispose(pod).await?;
        }

        let mut slots: Vec<Option<Pod>> = Vec::with_capacity(replicas);
        for (index, slot) in assignment.slots.iter().enumerate() {
            if ctx.is_shutdown() {
                return Ok(Requeue::Done);
            }
            let current = match slot {
                Some(pod) => {
                    let task = task_for(index);
                    Some(self.ensure_assignment(pod, index, task.as_deref()).await?)
                }
                None => None,
            };
            slots.push(current);
        }

        let missing = assignment.missing();
        let fill = if missing.is_empty() {
            Fill::default()
        } else if pooled {
            self.claim_from_pool(key, pool_ref, &missing, &task_for, ctx).await?
        } else {
            self.create_direct(key, bs, &missing, &task_for, ctx).await?
        };
        for (index, pod) in fill.placed {
            slots[index] = Some(pod);
        }

        self.write_status(bs, status_for(bs, &slots, fill.unavailable.as_deref()))
            .await?;

        if fill.shortage > 0 {
            info!(
                shortage = fill.shortage,
                retry_secs = self.pool_retry.as_secs(),
                "Pool cannot serve every replica yet"
            );
            return Ok(Requeue::After(self.pool_retry));
        }
        Ok(Requeue::Done)
    }

    /// Make sure a serving pod carries its ordinal and task. Returns the pod
    /// as it now stands.
    async fn ensure_assignment(
        &self,
        pod: &Pod,
        index: usize,
        task: Option<&str>,
    ) -> ControllerResult<Pod> {
        match pods::with_assignment(pod, index, task) {
            Some(updated) => {
                let updated = self.client.update_pod(&updated).await?;
                debug!(pod = %labels::pod_name(pod), index, "Updated replica assignment");
                Ok(updated)
            }
            None => Ok(pod.clone()),
        }
    }

    /// Release a pool pod or delete a directly owned one.
    async fn dispose(&self, pod: &Pod) -> ControllerResult<()> {
        let name = labels::pod_name(pod);
        let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
        match labels::owner(pod) {
            Some((ResourceKind::Pool, pool)) => {
                match self.client.update_pod(&pods::release(pod)).await {
                    Ok(_) => {
                        info!(pod = %name, pool = %pool, "Released pod back to pool");
                        Ok(())
                    }
                    Err(e) if e.is_not_found() => Ok(()),
                    Err(e) => Err(e.into()),
                }
            }
            _ => match self
                .client
                .delete_pod(namespace, name, &Preconditions::none())
                .await
            {
                Ok(()) => {
                    info!(pod = %name, "Deleted replica pod");
                    Ok(())
                }
                Err(e) if e.is_not_found() => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    async fn claim_from_pool(
        &self,
        key: &ObjectKey,
        pool_ref: Option<&str>,
        missing: &[usize],
        task_for: &(dyn Fn(usize) -> Option<String> + Sync),
        ctx: &ReconcileContext,
    ) -> ControllerResult<Fill> {
        let mut fill = Fill::default();
        let Some(pool) = pool_ref.filter(|pool| self.cache.get_pool(&key.namespace, pool).is_some())
        else {
            fill.shortage = missing.len();
            fill.unavailable = Some(match pool_ref {
                Some(pool) => format!("pool {pool} not found"),
                None => "no poolRef set".to_string(),
            });
            return Ok(fill);
        };

        let owned = self.live_pods(&key.namespace, &labels::owned_by(ResourceKind::Pool, pool));
        let mut candidates: Vec<&Pod> = owned
            .iter()
            .map(|pod| pod.as_ref())
            .filter(|pod| labels::assigned_to(pod).is_none() && labels::is_pod_ready(pod))
            .collect();
        MultiPodSorter::index_then_name(Default::default()).sort(&mut candidates);
        let mut candidates = candidates.into_iter();

        for &index in missing {
            if ctx.is_shutdown() {
                break;
            }
            let task = task_for(index);
            let claimed = loop {
                let Some(candidate) = candidates.next() else {
                    break None;
                };
                let claim = pods::claim(candidate, &key.name, index, task.as_deref());
                match self.client.update_pod(&claim).await {
                    Ok(pod) => break Some(pod),
                    // Someone else got there first; try the next one.
                    Err(e) if e.is_conflict() || e.is_not_found() => {
                        debug!(pod = %labels::pod_name(candidate), error = %e, "Lost claim race");
                    }
                    Err(e) => return Err(e.into()),
                }
            };
            match claimed {
                Some(pod) => {
                    info!(pod = %labels::pod_name(&pod), index, pool = %pool, "Claimed pool pod");
                    fill.placed.push((index, pod));
                }
                None => fill.shortage += 1,
            }
        }

        if fill.shortage > 0 {
            fill.unavailable = Some(format!(
                "pool {pool} has no ready pods for {} replica(s)",
                fill.shortage
            ));
        }
        Ok(fill)
    }

    async fn create_direct(
        &self,
        key: &ObjectKey,
        bs: &BatchSandbox,
        missing: &[usize],
        task_for: &(dyn Fn(usize) -> Option<String> + Sync),
        ctx: &ReconcileContext,
    ) -> ControllerResult<Fill> {
        let template = bs
            .spec
            .template
            .as_ref()
            .ok_or_else(|| ControllerError::MissingTemplate {
                key: key.to_string(),
                what: "batch sandbox",
            })?;
        let hash = pods::template_hash(template);
        let owner = PodOwner {
            kind: ResourceKind::BatchSandbox,
            name: &key.name,
            reference: bs.controller_owner_ref(&()),
        };

        let mut fill = Fill::default();
        for &index in missing {
            if ctx.is_shutdown() {
                break;
            }
            let name = format!("{}-{}", key.name, index);
            let pod = pods::pod_from_template(template, &key.namespace, &name, &owner, &hash);
            let task = task_for(index);
            let pod = pods::with_assignment(&pod, index, task.as_deref()).unwrap_or(pod);
            match self.client.create_pod(&pod).await {
                Ok(created) => {
                    info!(pod = %name, index, "Created replica pod");
                    fill.placed.push((index, created));
                }
                // Still terminating or not yet in the cache.
                Err(e) if e.is_already_exists() => {
                    debug!(pod = %name, "Replica pod already exists");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(fill)
    }

    /// The BatchSandbox is gone: hand pool pods back and delete our own.
    #[instrument(skip(self, ctx), fields(namespace = %key.namespace, name = %key.name))]
    async fn cleanup(&self, key: &ObjectKey, ctx: &ReconcileContext) -> ControllerResult<Requeue> {
        let assigned = self.live_pods(&key.namespace, &labels::assigned_to_selector(&key.name));
        let owned = self.live_pods(
            &key.namespace,
            &labels::owned_by(ResourceKind::BatchSandbox, &key.name),
        );
        for pod in assigned.iter().chain(owned.iter()) {
            if ctx.is_shutdown() {
                return Ok(Requeue::Done);
            }
            self.dispose(pod).await?;
        }
        if !assigned.is_empty() || !owned.is_empty() {
            info!(
                released = assigned.len(),
                deleted = owned.len(),
                "Cleaned up deleted BatchSandbox"
            );
        }
        Ok(Requeue::Done)
    }

    async fn write_status(
        &self,
        bs: &BatchSandbox,
        status: BatchSandboxStatus,
    ) -> ControllerResult<()> {
        if bs.status.as_ref() == Some(&status) {
            return Ok(());
        }
        match self.client.update_batch_sandbox_status(bs, &status).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn status_for(
    bs: &BatchSandbox,
    slots: &[Option<Pod>],
    unavailable: Option<&str>,
) -> BatchSandboxStatus {
    let previous = bs.status.clone().unwrap_or_default();
    let now = Utc::now();
    let replica_statuses: Vec<ReplicaStatus> = slots
        .iter()
        .enumerate()
        .filter_map(|(index, pod)| {
            let pod = pod.as_ref()?;
            let pod_name = labels::pod_name(pod).to_string();
            let ready = labels::is_pod_ready(pod);
            let last_transition_time = previous
                .replica_statuses
                .iter()
                .find(|r| r.index == index as i32 && r.pod_name == pod_name && r.ready == ready)
                .map(|r| r.last_transition_time)
                .unwrap_or(now);
            Some(ReplicaStatus {
                index: index as i32,
                pod_name,
                pod_ip: labels::pod_ip(pod).map(str::to_string),
                ready,
                last_transition_time,
            })
        })
        .collect();

    let ready = replica_statuses.iter().filter(|r| r.ready).count();
    let mut conditions = previous.conditions;
    remove_condition(&mut conditions, condition_types::TASK_GENERATION_FAILED);
    remove_condition(&mut conditions, condition_types::RECONCILE_FAILED);
    match unavailable {
        Some(message) => set_condition(
            &mut conditions,
            Condition::new(
                condition_types::POOL_UNAVAILABLE,
                ConditionStatus::True,
                "InsufficientPods",
                message,
            ),
        ),
        None => remove_condition(&mut conditions, condition_types::POOL_UNAVAILABLE),
    }
    let all_ready = ready == slots.len();
    set_condition(
        &mut conditions,
        if all_ready {
            Condition::new(
                condition_types::READY,
                ConditionStatus::True,
                "AllReplicasReady",
                "every replica has a ready pod",
            )
        } else {
            Condition::new(
                condition_types::READY,
                ConditionStatus::False,
                "ReplicasNotReady",
                "waiting for replica pods",
            )
        },
    );

    BatchSandboxStatus {
        observed_generation: bs.metadata.generation,
        replicas: replica_statuses.len() as i32,
        ready: ready as i32,
        replica_statuses,
        conditions,
    }
}

#[async_trait]
impl Reconciler for BatchReconciler {
    async fn reconcile(
        &self,
        namespace: &str,
        name: &str,
        ctx: &ReconcileContext,
    ) -> ControllerResult<Requeue> {
        let key = ObjectKey::batch_sandbox(namespace, name);
        match self.cache.get_batch_sandbox(namespace, name) {
            Some(bs) => self.reconcile_batch(&key, &bs, ctx).await,
            None => self.cleanup(&key, ctx).await,
        }
    }

    async fn record_failure(
        &self,
        namespace: &str,
        name: &str,
        condition: Condition,
    ) -> ControllerResult<()> {
        let Some(bs) = self.cache.get_batch_sandbox(namespace, name) else {
            return Ok(());
        };
        let mut status = bs.status.clone().unwrap_or_default();
        status.observed_generation = bs.metadata.generation;
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
        self.write_status(&bs, status).await
    }
}
