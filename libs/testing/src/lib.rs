//! # sandbox-testing
//!
//! Test support for the sandbox controller:
//!
//! - [`FakeCluster`]: an in-memory cluster implementing both
//!   [`ResourceCache`] and [`ClusterClient`], with resource versions,
//!   optimistic concurrency, error injection and optional cache lag.
//! - [`fixtures`]: builders for pools, batch sandboxes and pods.

pub mod fixtures;

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use k8s_openapi::api::core::v1::{Pod, PodCondition, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use sandbox_api::{
    BatchSandbox, BatchSandboxStatus, ClusterClient, ClusterError, LabelSelector, Pool,
    PoolStatus, Preconditions, ResourceCache,
};

type Key = (String, String);

/// A write the controller issued against the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    CreatePod(String),
    UpdatePod(String),
    DeletePod(String),
    UpdatePoolStatus(String),
    UpdateBatchSandboxStatus(String),
}

/// Which client operation an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    CreatePod,
    UpdatePod,
    DeletePod,
    UpdateStatus,
}

#[derive(Debug, Clone, Default)]
struct Store {
    pools: BTreeMap<Key, Arc<Pool>>,
    batch_sandboxes: BTreeMap<Key, Arc<BatchSandbox>>,
    pods: BTreeMap<Key, Arc<Pod>>,
}

#[derive(Debug, Default)]
struct State {
    live: Store,
    /// Frozen view served to readers while lag is enabled.
    snapshot: Option<Store>,
    resource_version: u64,
    actions: Vec<Action>,
    failures: VecDeque<(Op, ClusterError)>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.resource_version += 1;
        self.resource_version
    }

    fn view(&self) -> &Store {
        self.snapshot.as_ref().unwrap_or(&self.live)
    }

    fn take_failure(&mut self, op: Op) -> Option<ClusterError> {
        let pos = self.failures.iter().position(|(o, _)| *o == op)?;
        self.failures.remove(pos).map(|(_, err)| err)
    }
}

fn key_of(namespace: Option<String>, name: &str) -> Key {
    (namespace.unwrap_or_else(|| "default".to_string()), name.to_string())
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).single().unwrap_or_default()
}

/// In-memory cluster.
///
/// Pod creation timestamps advance one second per write so creation order
/// is observable and deterministic.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Freeze the cache at the current state. Writes keep landing in the
    /// live store but readers see the frozen view until [`Self::sync`].
    pub fn freeze_cache(&self) {
        let mut state = self.state();
        state.snapshot = Some(state.live.clone());
    }

    /// Bring a frozen cache up to date (it stays frozen).
    pub fn sync(&self) {
        let mut state = self.state();
        if state.snapshot.is_some() {
            state.snapshot = Some(state.live.clone());
        }
    }

    /// Stop lagging; readers see live state again.
    pub fn unfreeze_cache(&self) {
        self.state().snapshot = None;
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: Op, err: ClusterError) {
        self.state().failures.push_back((op, err));
    }

    pub fn actions(&self) -> Vec<Action> {
        self.state().actions.clone()
    }

    pub fn clear_actions(&self) {
        self.state().actions.clear();
    }

    pub fn apply_pool(&self, mut pool: Pool) {
        let mut state = self.state();
        let version = state.next_version();
        pool.metadata.resource_version = Some(version.to_string());
        let generation = pool.metadata.generation.unwrap_or(0) + 1;
        pool.metadata.generation = Some(generation);
        let key = key_of(pool.namespace(), &pool.name_any());
        if let Some(existing) = state.live.pools.get(&key) {
            pool.status = existing.status.clone();
        }
        state.live.pools.insert(key, Arc::new(pool));
    }

    pub fn apply_batch_sandbox(&self, mut batch_sandbox: BatchSandbox) {
        let mut state = self.state();
        let version = state.next_version();
        batch_sandbox.metadata.resource_version = Some(version.to_string());
        let generation = batch_sandbox.metadata.generation.unwrap_or(0) + 1;
        batch_sandbox.metadata.generation = Some(generation);
        let key = key_of(batch_sandbox.namespace(), &batch_sandbox.name_any());
        if let Some(existing) = state.live.batch_sandboxes.get(&key) {
            batch_sandbox.status = existing.status.clone();
        }
        state.live.batch_sandboxes.insert(key, Arc::new(batch_sandbox));
    }

    /// Insert a pod as-is, stamping version and creation time.
    pub fn apply_pod(&self, mut pod: Pod) {
        let mut state = self.state();
        let version = state.next_version();
        stamp_new_pod(&mut pod, version);
        let key = key_of(pod.namespace(), &pod.name_any());
        state.live.pods.insert(key, Arc::new(pod));
    }

    pub fn delete_pool(&self, namespace: &str, name: &str) {
        self.state()
            .live
            .pools
            .remove(&(namespace.to_string(), name.to_string()));
    }

    pub fn delete_batch_sandbox(&self, namespace: &str, name: &str) {
        self.state()
            .live
            .batch_sandboxes
            .remove(&(namespace.to_string(), name.to_string()));
    }

    /// Flip the Ready condition of a live pod.
    pub fn set_pod_ready(&self, namespace: &str, name: &str, ready: bool) {
        let mut state = self.state();
        let version = state.next_version();
        let key = (namespace.to_string(), name.to_string());
        if let Some(pod) = state.live.pods.get(&key) {
            let mut pod = (**pod).clone();
            set_ready_condition(&mut pod, ready);
            pod.metadata.resource_version = Some(version.to_string());
            state.live.pods.insert(key, Arc::new(pod));
        }
    }

    /// Mark every live pod in the namespace ready.
    pub fn mark_all_ready(&self, namespace: &str) {
        let names: Vec<String> = self
            .pods(namespace)
            .iter()
            .map(|pod| pod.name_any())
            .collect();
        for name in names {
            self.set_pod_ready(namespace, &name, true);
        }
    }

    /// Live pods in the namespace, sorted by name.
    pub fn pods(&self, namespace: &str) -> Vec<Pod> {
        self.state()
            .live
            .pods
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, pod)| (**pod).clone())
            .collect()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state()
            .live
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .map(|pod| (**pod).clone())
    }

    pub fn pool_status(&self, namespace: &str, name: &str) -> Option<PoolStatus> {
        self.state()
            .live
            .pools
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|pool| pool.status.clone())
    }

    pub fn batch_sandbox_status(&self, namespace: &str, name: &str) -> Option<BatchSandboxStatus> {
        self.state()
            .live
            .batch_sandboxes
            .get(&(namespace.to_string(), name.to_string()))
            .and_then(|bs| bs.status.clone())
    }
}

fn stamp_new_pod(pod: &mut Pod, version: u64) {
    pod.metadata.resource_version = Some(version.to_string());
    pod.metadata.uid = Some(format!("uid-{version}"));
    if pod.metadata.creation_timestamp.is_none() {
        pod.metadata.creation_timestamp = Some(Time(epoch() + Duration::seconds(version as i64)));
    }
    if pod.metadata.namespace.is_none() {
        pod.metadata.namespace = Some("default".to_string());
    }
}

/// Set or replace the pod's Ready condition.
pub fn set_ready_condition(pod: &mut Pod, ready: bool) {
    let status = pod.status.get_or_insert_with(PodStatus::default);
    let conditions = status.conditions.get_or_insert_with(Vec::new);
    conditions.retain(|c| c.type_ != "Ready");
    conditions.push(PodCondition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        ..Default::default()
    });
    if ready && status.pod_ip.is_none() {
        status.pod_ip = Some("10.0.0.1".to_string());
    }
}

impl ResourceCache for FakeCluster {
    fn get_pool(&self, namespace: &str, name: &str) -> Option<Arc<Pool>> {
        self.state()
            .view()
            .pools
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn get_batch_sandbox(&self, namespace: &str, name: &str) -> Option<Arc<BatchSandbox>> {
        self.state()
            .view()
            .batch_sandboxes
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn list_batch_sandboxes(&self, namespace: &str) -> Vec<Arc<BatchSandbox>> {
        self.state()
            .view()
            .batch_sandboxes
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, bs)| bs.clone())
            .collect()
    }

    fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Vec<Arc<Pod>> {
        self.state()
            .view()
            .pods
            .iter()
            .filter(|((ns, _), pod)| {
                ns == namespace && selector.matches(pod.metadata.labels.as_ref())
            })
            .map(|(_, pod)| pod.clone())
            .collect()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::CreatePod) {
            return Err(err);
        }
        let key = key_of(pod.namespace(), &pod.name_any());
        if state.live.pods.contains_key(&key) {
            return Err(ClusterError::AlreadyExists(key.1));
        }
        let version = state.next_version();
        let mut created = pod.clone();
        created.metadata.creation_timestamp = None;
        stamp_new_pod(&mut created, version);
        state.actions.push(Action::CreatePod(key.1.clone()));
        state.live.pods.insert(key, Arc::new(created.clone()));
        Ok(created)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::UpdatePod) {
            return Err(err);
        }
        let key = key_of(pod.namespace(), &pod.name_any());
        let Some(current) = state.live.pods.get(&key) else {
            return Err(ClusterError::NotFound(key.1));
        };
        if pod.metadata.resource_version.is_some()
            && pod.metadata.resource_version != current.metadata.resource_version
        {
            return Err(ClusterError::Conflict(key.1));
        }
        let mut updated = pod.clone();
        updated.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        updated.metadata.uid = current.metadata.uid.clone();
        updated.status = current.status.clone();
        let version = state.next_version();
        updated.metadata.resource_version = Some(version.to_string());
        state.actions.push(Action::UpdatePod(key.1.clone()));
        state.live.pods.insert(key, Arc::new(updated.clone()));
        Ok(updated)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::DeletePod) {
            return Err(err);
        }
        let key = (namespace.to_string(), name.to_string());
        if let Some(current) = state.live.pods.get(&key) {
            let stale = |expected: &Option<String>, actual: &Option<String>| {
                expected.is_some() && expected != actual
            };
            if stale(&preconditions.resource_version, &current.metadata.resource_version)
                || stale(&preconditions.uid, &current.metadata.uid)
            {
                return Err(ClusterError::Conflict(key.1));
            }
        }
        state.actions.push(Action::DeletePod(name.to_string()));
        state.live.pods.remove(&key);
        Ok(())
    }

    async fn update_pool_status(
        &self,
        pool: &Pool,
        status: &PoolStatus,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::UpdateStatus) {
            return Err(err);
        }
        let key = key_of(pool.namespace(), &pool.name_any());
        let Some(current) = state.live.pools.get(&key) else {
            return Err(ClusterError::NotFound(key.1));
        };
        let mut updated = (**current).clone();
        updated.status = Some(status.clone());
        state.actions.push(Action::UpdatePoolStatus(key.1.clone()));
        state.live.pools.insert(key, Arc::new(updated));
        Ok(())
    }

    async fn update_batch_sandbox_status(
        &self,
        batch_sandbox: &BatchSandbox,
        status: &BatchSandboxStatus,
    ) -> Result<(), ClusterError> {
        let mut state = self.state();
        if let Some(err) = state.take_failure(Op::UpdateStatus) {
            return Err(err);
        }
        let key = key_of(batch_sandbox.namespace(), &batch_sandbox.name_any());
        let Some(current) = state.live.batch_sandboxes.get(&key) else {
            return Err(ClusterError::NotFound(key.1));
        };
        let mut updated = (**current).clone();
        updated.status = Some(status.clone());
        state
            .actions
            .push(Action::UpdateBatchSandboxStatus(key.1.clone()));
        state.live.batch_sandboxes.insert(key, Arc::new(updated));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[tokio::test]
    async fn test_create_conflicts_on_duplicate_name() {
        let cluster = FakeCluster::new();
        let pod = fixtures::pod("default", "p-0");

        cluster.create_pod(&pod).await.unwrap();
        let err = cluster.create_pod(&pod).await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_update_rejects_stale_version() {
        let cluster = FakeCluster::new();
        let created = cluster
            .create_pod(&fixtures::pod("default", "p-0"))
            .await
            .unwrap();

        cluster.update_pod(&created).await.unwrap();
        let err = cluster.update_pod(&created).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_frozen_cache_lags_writes() {
        let cluster = FakeCluster::new();
        cluster.freeze_cache();
        cluster
            .create_pod(&fixtures::pod("default", "p-0"))
            .await
            .unwrap();

        let everything = LabelSelector::everything();
        assert!(cluster.list_pods("default", &everything).is_empty());
        cluster.sync();
        assert_eq!(cluster.list_pods("default", &everything).len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure_is_consumed_once() {
        let cluster = FakeCluster::new();
        cluster.fail_next(Op::DeletePod, ClusterError::Throttled("slow down".into()));

        let none = Preconditions::none();
        assert!(cluster.delete_pod("default", "p", &none).await.is_err());
        assert!(cluster.delete_pod("default", "p", &none).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_honours_preconditions() {
        let cluster = FakeCluster::new();
        let created = cluster
            .create_pod(&fixtures::pod("default", "p-0"))
            .await
            .unwrap();
        let observed = Preconditions::observed(&created);
        cluster.update_pod(&created).await.unwrap();

        let err = cluster
            .delete_pod("default", "p-0", &observed)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(cluster.pod("default", "p-0").is_some());

        let current = Preconditions::observed(&cluster.pod("default", "p-0").unwrap());
        cluster.delete_pod("default", "p-0", &current).await.unwrap();
        assert!(cluster.pod("default", "p-0").is_none());
    }
}
