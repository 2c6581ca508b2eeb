//! Custom resource definitions and derived value types.
//!
//! Pool and BatchSandbox are namespaced resources in the
//! `sandbox.opensandbox.io/v1alpha1` group. Their specs are owned by the
//! user; only the `status` subresource is written by the controller.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{EnvVar, PodTemplateSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Pool
// =============================================================================

/// Desired state of a warm pod pool.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sandbox.opensandbox.io",
    version = "v1alpha1",
    kind = "Pool",
    namespaced,
    status = "PoolStatus",
    shortname = "sbxpool"
)]
#[serde(rename_all = "camelCase")]
pub struct PoolSpec {
    /// Pod template used to create warm instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,

    /// Size bounds for the pool and its standby buffer.
    #[serde(default)]
    pub capacity_spec: CapacitySpec,
}

/// Size bounds for a pool.
///
/// `pool_min..=pool_max` bounds every pod the pool owns;
/// `buffer_min..=buffer_max` bounds the pods that are ready and unassigned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacitySpec {
    #[serde(default)]
    pub pool_min: i32,
    #[serde(default)]
    pub pool_max: i32,
    #[serde(default)]
    pub buffer_min: i32,
    #[serde(default)]
    pub buffer_max: i32,
}

impl CapacitySpec {
    pub fn new(pool_min: i32, pool_max: i32, buffer_min: i32, buffer_max: i32) -> Self {
        Self {
            pool_min,
            pool_max,
            buffer_min,
            buffer_max,
        }
    }
}

/// Observed state of a pool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Live pods owned by the pool.
    #[serde(default)]
    pub total: i32,

    /// Pods currently serving a BatchSandbox replica.
    #[serde(default)]
    pub allocated: i32,

    /// Pods that are ready and unassigned.
    #[serde(default)]
    pub available: i32,

    /// Pods that are ready, assigned or not.
    #[serde(default)]
    pub total_ready: i32,

    /// Pod count the controller is converging towards.
    #[serde(default)]
    pub total_desired: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

// =============================================================================
// BatchSandbox
// =============================================================================

/// Desired state of a batch of sandbox replicas.
///
/// Exactly one of `template` and `pool_ref` is expected. An inline template
/// always wins: a BatchSandbox carrying one is served directly even if it
/// also names a pool.
#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "sandbox.opensandbox.io",
    version = "v1alpha1",
    kind = "BatchSandbox",
    namespaced,
    status = "BatchSandboxStatus",
    shortname = "bsbx"
)]
#[serde(rename_all = "camelCase")]
pub struct BatchSandboxSpec {
    /// Desired replica count. Unset means one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Name of the pool replicas are borrowed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_ref: Option<String>,

    /// Inline pod template for direct mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,

    /// Process shared by every replica.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_template: Option<TaskTemplateSpec>,

    /// Raw strategic merge patches, one per replica index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_task_patches: Option<Vec<serde_json::Value>>,
}

impl BatchSandbox {
    /// Desired replica count with the default applied. Negative counts
    /// collapse to zero.
    pub fn replicas(&self) -> usize {
        self.spec.replicas.unwrap_or(1).max(0) as usize
    }
}

/// Observed state of a BatchSandbox.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BatchSandboxStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Replicas that currently have a pod.
    #[serde(default)]
    pub replicas: i32,

    /// Replicas whose pod is ready.
    #[serde(default)]
    pub ready: i32,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub replica_statuses: Vec<ReplicaStatus>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// Per-replica routing record read by the proxy layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    pub index: i32,
    pub pod_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_ip: Option<String>,
    pub ready: bool,
    pub last_transition_time: DateTime<Utc>,
}

// =============================================================================
// Conditions
// =============================================================================

/// Well-known condition types.
pub mod condition_types {
    pub const READY: &str = "Ready";
    pub const INVALID_CAPACITY: &str = "InvalidCapacity";
    pub const TASK_GENERATION_FAILED: &str = "TaskGenerationFailed";
    pub const RECONCILE_FAILED: &str = "ReconcileFailed";
    pub const POOL_UNAVAILABLE: &str = "PoolUnavailable";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// A status condition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,

    /// Failed attempts behind a persistent failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: Utc::now(),
            retry_count: None,
        }
    }

    pub fn with_retry_count(mut self, retry_count: u32) -> Self {
        self.retry_count = Some(retry_count);
        self
    }

    /// Two conditions describe the same state if everything but the
    /// transition time matches.
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
            && self.retry_count == other.retry_count
    }
}

/// Insert or replace the condition of the same type.
///
/// The existing transition time is preserved when the condition did not
/// change.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) if existing.same_state(&condition) => {}
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

/// Drop the condition of the given type, if present.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

// =============================================================================
// Task template
// =============================================================================

/// Template for the process every replica runs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<TaskMetadata>,

    #[serde(default)]
    pub spec: TaskSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessTask>,

    /// Wall-clock budget for the process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessTask {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

// =============================================================================
// Task (derived)
// =============================================================================

/// The concrete unit of work for one replica.
///
/// Derived fresh on every reconciliation; never stored as a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
}

/// Process handed to the in-pod task executor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Process {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<i64>,
}
