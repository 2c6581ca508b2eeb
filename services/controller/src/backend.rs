//! Kubernetes implementation of the cache and cluster seams.
//!
//! Reads are served from reflector stores fed by watchers; every watch
//! event is also mapped to work-queue keys. Writes go straight to the API
//! server.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use sandbox_api::{
    labels, BatchSandbox, BatchSandboxStatus, ClusterClient, ClusterError, LabelSelector,
    ObjectKey, Pool, PoolStatus, Preconditions, ResourceCache,
};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::engine::events::{key_for_batch_sandbox, keys_for_pod, keys_for_pool};
use crate::engine::WorkQueue;

/// Translate an API server failure.
pub fn map_error(err: kube::Error) -> ClusterError {
    match err {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound(resp.message),
            409 if resp.reason == "AlreadyExists" => ClusterError::AlreadyExists(resp.message),
            409 => ClusterError::Conflict(resp.message),
            429 => ClusterError::Throttled(resp.message),
            400 | 422 => ClusterError::Invalid(resp.message),
            code => ClusterError::Api {
                code,
                message: resp.message,
            },
        },
        other => ClusterError::Transport(other.to_string()),
    }
}

fn in_namespace<K: ResourceExt>(obj: &K, namespace: &str) -> bool {
    obj.namespace().as_deref() == Some(namespace)
}

/// Reflector-backed [`ResourceCache`].
#[derive(Clone)]
pub struct KubeCache {
    pools: Store<Pool>,
    batch_sandboxes: Store<BatchSandbox>,
    pods: Store<Pod>,
}

impl ResourceCache for KubeCache {
    fn get_pool(&self, namespace: &str, name: &str) -> Option<Arc<Pool>> {
        self.pools.get(&ObjectRef::new(name).within(namespace))
    }

    fn get_batch_sandbox(&self, namespace: &str, name: &str) -> Option<Arc<BatchSandbox>> {
        self.batch_sandboxes
            .get(&ObjectRef::new(name).within(namespace))
    }

    fn list_batch_sandboxes(&self, namespace: &str) -> Vec<Arc<BatchSandbox>> {
        self.batch_sandboxes
            .state()
            .into_iter()
            .filter(|bs| in_namespace(bs.as_ref(), namespace))
            .collect()
    }

    fn list_pods(&self, namespace: &str, selector: &LabelSelector) -> Vec<Arc<Pod>> {
        self.pods
            .state()
            .into_iter()
            .filter(|pod| {
                in_namespace(pod.as_ref(), namespace)
                    && selector.matches(pod.metadata.labels.as_ref())
            })
            .collect()
    }
}

/// API-server backed [`ClusterClient`].
#[derive(Clone)]
pub struct KubeClient {
    client: Client,
}

impl KubeClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: Option<String>) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        let namespace = namespace.unwrap_or_else(|| "default".to_string());
        Api::namespaced(self.client.clone(), &namespace)
    }
}

#[async_trait]
impl ClusterClient for KubeClient {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        self.api::<Pod>(pod.namespace())
            .create(&PostParams::default(), pod)
            .await
            .map_err(map_error)
    }

    async fn update_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        self.api::<Pod>(pod.namespace())
            .replace(&pod.name_any(), &PostParams::default(), pod)
            .await
            .map_err(map_error)
    }

    async fn delete_pod(
        &self,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), ClusterError> {
        let mut params = DeleteParams::background();
        if !preconditions.is_empty() {
            params.preconditions = Some(kube::api::Preconditions {
                resource_version: preconditions.resource_version.clone(),
                uid: preconditions.uid.clone(),
            });
        }
        self.api::<Pod>(Some(namespace.to_string()))
            .delete(name, &params)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn update_pool_status(
        &self,
        pool: &Pool,
        status: &PoolStatus,
    ) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "status": status });
        self.api::<Pool>(pool.namespace())
            .patch_status(&pool.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn update_batch_sandbox_status(
        &self,
        batch_sandbox: &BatchSandbox,
        status: &BatchSandboxStatus,
    ) -> Result<(), ClusterError> {
        let patch = serde_json::json!({ "status": status });
        self.api::<BatchSandbox>(batch_sandbox.namespace())
            .patch_status(
                &batch_sandbox.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Feed a reflector store and turn each change into queue keys until
/// shutdown.
async fn run_watch<K, F>(
    api: Api<K>,
    config: watcher::Config,
    writer: reflector::store::Writer<K>,
    mut shutdown: watch::Receiver<bool>,
    on_change: F,
) where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
    F: Fn(&K) + Send,
{
    let kind = K::kind(&Default::default()).to_string();
    let stream = watcher::watcher(api, config).default_backoff().reflect(writer);
    let mut stream = std::pin::pin!(stream);

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = stream.next() => match event {
                Some(Ok(Event::Apply(obj) | Event::InitApply(obj) | Event::Delete(obj))) => {
                    on_change(&obj);
                }
                Some(Ok(Event::Init | Event::InitDone)) => {
                    debug!(kind = %kind, "Watch (re)listing");
                }
                Some(Err(e)) => warn!(kind = %kind, error = %e, "Watch error"),
                None => break,
            },
        }
    }
    debug!(kind = %kind, "Watch stopped");
}

/// Start watchers for pools, batch sandboxes and managed pods, wait for the
/// initial list, and return the cache they feed.
pub async fn start_watchers(
    client: Client,
    namespace: Option<&str>,
    queue: WorkQueue<ObjectKey>,
    shutdown: watch::Receiver<bool>,
    tasks: &mut JoinSet<()>,
) -> anyhow::Result<Arc<KubeCache>> {
    let (pools, pool_writer) = reflector::store::<Pool>();
    let (batch_sandboxes, batch_writer) = reflector::store::<BatchSandbox>();
    let (pods, pod_writer) = reflector::store::<Pod>();
    let cache = Arc::new(KubeCache {
        pools: pools.clone(),
        batch_sandboxes: batch_sandboxes.clone(),
        pods: pods.clone(),
    });

    tasks.spawn({
        let queue = queue.clone();
        let cache = Arc::clone(&cache);
        run_watch(
            scoped_api::<Pool>(&client, namespace),
            watcher::Config::default(),
            pool_writer,
            shutdown.clone(),
            move |pool: &Pool| {
                for key in keys_for_pool(pool, cache.as_ref()) {
                    queue.add(key);
                }
            },
        )
    });

    tasks.spawn({
        let queue = queue.clone();
        run_watch(
            scoped_api::<BatchSandbox>(&client, namespace),
            watcher::Config::default(),
            batch_writer,
            shutdown.clone(),
            move |bs: &BatchSandbox| queue.add(key_for_batch_sandbox(bs)),
        )
    });

    tasks.spawn({
        let queue = queue.clone();
        run_watch(
            scoped_api::<Pod>(&client, namespace),
            watcher::Config::default().labels(labels::OWNER_KIND),
            pod_writer,
            shutdown,
            move |pod: &Pod| {
                for key in keys_for_pod(pod) {
                    queue.add(key);
                }
            },
        )
    });

    pools.wait_until_ready().await?;
    batch_sandboxes.wait_until_ready().await?;
    pods.wait_until_ready().await?;
    info!(
        pools = pools.state().len(),
        batch_sandboxes = batch_sandboxes.state().len(),
        pods = pods.state().len(),
        "Caches synced"
    );

    Ok(cache)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;
    use rstest::rstest;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[rstest]
    #[case(404, "NotFound", ClusterError::NotFound("boom".into()))]
    #[case(409, "AlreadyExists", ClusterError::AlreadyExists("boom".into()))]
    #[case(409, "Conflict", ClusterError::Conflict("boom".into()))]
    #[case(429, "TooManyRequests", ClusterError::Throttled("boom".into()))]
    #[case(422, "Invalid", ClusterError::Invalid("boom".into()))]
    #[case(500, "InternalError", ClusterError::Api { code: 500, message: "boom".into() })]
    fn test_map_error(#[case] code: u16, #[case] reason: &str, #[case] expected: ClusterError) {
        assert_eq!(map_error(api_error(code, reason)), expected);
    }
}
