//! Mapping from watch events to work-queue keys.
//!
//! Handlers never look at what changed; they only name the objects whose
//! desired state may now differ from what is observed.

use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use sandbox_api::{labels, BatchSandbox, ObjectKey, Pool, ResourceCache, ResourceKind};

use crate::strategy::{resolve_pool_strategy, PoolStrategy};

fn namespace_of<K: ResourceExt>(obj: &K) -> String {
    obj.namespace().unwrap_or_else(|| "default".to_string())
}

/// A pod change concerns its owner and, for pool pods, the BatchSandbox it
/// serves.
pub fn keys_for_pod(pod: &Pod) -> Vec<ObjectKey> {
    let namespace = namespace_of(pod);
    let mut keys = Vec::with_capacity(2);
    if let Some((kind, name)) = labels::owner(pod) {
        keys.push(ObjectKey::new(kind, namespace.clone(), name));
    }
    if let Some(batch) = labels::assigned_to(pod) {
        let key = ObjectKey::batch_sandbox(namespace, batch);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// A pool change concerns the pool and every BatchSandbox drawing from it.
pub fn keys_for_pool(pool: &Pool, cache: &dyn ResourceCache) -> Vec<ObjectKey> {
    let namespace = namespace_of(pool);
    let name = pool.name_any();
    let mut keys = vec![ObjectKey::pool(namespace.clone(), name.clone())];
    keys.extend(
        cache
            .list_batch_sandboxes(&namespace)
            .iter()
            .filter(|bs| resolve_pool_strategy(bs).pool_ref() == Some(name.as_str()))
            .map(|bs| ObjectKey::batch_sandbox(namespace.clone(), bs.name_any())),
    );
    keys
}

pub fn key_for_batch_sandbox(batch_sandbox: &BatchSandbox) -> ObjectKey {
    ObjectKey::new(
        ResourceKind::BatchSandbox,
        namespace_of(batch_sandbox),
        batch_sandbox.name_any(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_api::CapacitySpec;
    use sandbox_testing::{fixtures, FakeCluster};

    #[test]
    fn test_pool_pod_maps_to_pool() {
        let pod = fixtures::pool_pod("ns", "warm-0", "warm", true);
        assert_eq!(keys_for_pod(&pod), [ObjectKey::pool("ns", "warm")]);
    }

    #[test]
    fn test_assigned_pod_maps_to_pool_and_batch() {
        let pod = fixtures::assigned_pod("ns", "warm-0", "warm", "job", Some(0));
        assert_eq!(
            keys_for_pod(&pod),
            [
                ObjectKey::pool("ns", "warm"),
                ObjectKey::batch_sandbox("ns", "job")
            ]
        );
    }

    #[test]
    fn test_unowned_pod_maps_to_nothing() {
        assert!(keys_for_pod(&fixtures::pod("ns", "stray")).is_empty());
    }

    #[test]
    fn test_pool_maps_to_referencing_batches() {
        let cluster = FakeCluster::new();
        cluster.apply_batch_sandbox(fixtures::pooled_batch_sandbox("ns", "a", "warm", 1));
        cluster.apply_batch_sandbox(fixtures::pooled_batch_sandbox("ns", "b", "cold", 1));
        cluster.apply_batch_sandbox(fixtures::direct_batch_sandbox("ns", "c", 1));
        let pool = fixtures::pool("ns", "warm", CapacitySpec::new(0, 1, 0, 1));

        assert_eq!(
            keys_for_pool(&pool, &cluster),
            [ObjectKey::pool("ns", "warm"), ObjectKey::batch_sandbox("ns", "a")]
        );
    }
}
