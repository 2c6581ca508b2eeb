//! Builders for test objects.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, EnvVar, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use sandbox_api::{
    labels, BatchSandbox, BatchSandboxSpec, CapacitySpec, Pool, PoolSpec, ProcessTask,
    ResourceKind, TaskSpec, TaskTemplateSpec,
};

pub fn pod_template(image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(BTreeMap::from([("app".to_string(), "sandbox".to_string())])),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "sandbox".to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

pub fn pool(namespace: &str, name: &str, capacity: CapacitySpec) -> Pool {
    let mut pool = Pool::new(
        name,
        PoolSpec {
            template: Some(pod_template("sandbox:latest")),
            capacity_spec: capacity,
        },
    );
    pool.metadata.namespace = Some(namespace.to_string());
    pool.metadata.uid = Some(format!("pool-uid-{name}"));
    pool
}

pub fn pooled_batch_sandbox(
    namespace: &str,
    name: &str,
    pool: &str,
    replicas: i32,
) -> BatchSandbox {
    let mut bs = BatchSandbox::new(
        name,
        BatchSandboxSpec {
            replicas: Some(replicas),
            pool_ref: Some(pool.to_string()),
            ..Default::default()
        },
    );
    bs.metadata.namespace = Some(namespace.to_string());
    bs.metadata.uid = Some(format!("bs-uid-{name}"));
    bs
}

pub fn direct_batch_sandbox(namespace: &str, name: &str, replicas: i32) -> BatchSandbox {
    let mut bs = BatchSandbox::new(
        name,
        BatchSandboxSpec {
            replicas: Some(replicas),
            template: Some(pod_template("sandbox:latest")),
            ..Default::default()
        },
    );
    bs.metadata.namespace = Some(namespace.to_string());
    bs.metadata.uid = Some(format!("bs-uid-{name}"));
    bs
}

pub fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

pub fn task_template(command: &[&str], timeout_seconds: Option<i64>) -> TaskTemplateSpec {
    TaskTemplateSpec {
        metadata: None,
        spec: TaskSpec {
            process: Some(ProcessTask {
                command: command.iter().map(|s| s.to_string()).collect(),
                args: Vec::new(),
                env: vec![env("MODE", "batch")],
                working_dir: Some("/workspace".to_string()),
            }),
            timeout_seconds,
        },
    }
}

/// A bare pod with no owner.
pub fn pod(namespace: &str, name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::new()),
            ..Default::default()
        },
        spec: pod_template("sandbox:latest").spec,
        ..Default::default()
    }
}

/// A pod owned by the named pool, optionally ready.
pub fn pool_pod(namespace: &str, name: &str, pool: &str, ready: bool) -> Pod {
    let mut pod = pod(namespace, name);
    let pod_labels = pod.metadata.labels.get_or_insert_with(BTreeMap::new);
    pod_labels.insert(labels::OWNER_KIND.to_string(), ResourceKind::Pool.to_string());
    pod_labels.insert(labels::OWNER_NAME.to_string(), pool.to_string());
    crate::set_ready_condition(&mut pod, ready);
    pod
}

/// A pool pod already serving `batch_sandbox` at `index`.
pub fn assigned_pod(
    namespace: &str,
    name: &str,
    pool: &str,
    batch_sandbox: &str,
    index: Option<usize>,
) -> Pod {
    let mut pod = pool_pod(namespace, name, pool, true);
    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(labels::ASSIGNED_TO.to_string(), batch_sandbox.to_string());
    if let Some(index) = index {
        pod.metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(labels::INDEX_ANNOTATION.to_string(), index.to_string());
    }
    pod
}
