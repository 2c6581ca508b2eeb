//! Well-known labels and annotations, and helpers reading them off pods.
//!
//! Every pod the controller manages has exactly one owner, recorded in the
//! owner-kind/owner-name labels. A pool-owned pod that serves a pooled
//! BatchSandbox replica additionally carries the assigned-to label and the
//! index annotation.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use crate::{LabelSelector, ResourceKind};

pub const OWNER_KIND: &str = "sandbox.opensandbox.io/owner-kind";
pub const OWNER_NAME: &str = "sandbox.opensandbox.io/owner-name";
pub const ASSIGNED_TO: &str = "sandbox.opensandbox.io/assigned-to";
pub const TEMPLATE_HASH: &str = "sandbox.opensandbox.io/template-hash";

pub const INDEX_ANNOTATION: &str = "sandbox.opensandbox.io/index";
pub const TASK_ANNOTATION: &str = "sandbox.opensandbox.io/task";

/// Selector for every pod owned by the given object.
pub fn owned_by(kind: ResourceKind, name: &str) -> LabelSelector {
    LabelSelector::everything()
        .eq(OWNER_KIND, kind.as_str())
        .eq(OWNER_NAME, name)
}

/// Selector for every pod assigned to the given BatchSandbox.
pub fn assigned_to_selector(batch_sandbox: &str) -> LabelSelector {
    LabelSelector::everything().eq(ASSIGNED_TO, batch_sandbox)
}

pub fn pod_name(pod: &Pod) -> &str {
    pod.metadata.name.as_deref().unwrap_or_default()
}

fn label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(key))
        .map(String::as_str)
}

fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(key))
        .map(String::as_str)
}

/// The object that owns the pod, if any.
pub fn owner(pod: &Pod) -> Option<(ResourceKind, &str)> {
    let kind = ResourceKind::parse(label(pod, OWNER_KIND)?)?;
    let name = label(pod, OWNER_NAME)?;
    Some((kind, name))
}

/// The BatchSandbox a pool-owned pod currently serves.
pub fn assigned_to(pod: &Pod) -> Option<&str> {
    label(pod, ASSIGNED_TO).filter(|name| !name.is_empty())
}

/// The replica ordinal recorded on the pod. Unparseable values read as
/// unassigned.
pub fn pod_index(pod: &Pod) -> Option<usize> {
    annotation(pod, INDEX_ANNOTATION)?.parse().ok()
}

pub fn template_hash(pod: &Pod) -> Option<&str> {
    label(pod, TEMPLATE_HASH)
}

pub fn task_annotation(pod: &Pod) -> Option<&str> {
    annotation(pod, TASK_ANNOTATION)
}

/// Ready condition is `True`.
pub fn is_pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// The pod has been asked to go away.
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

pub fn creation_time(pod: &Pod) -> Option<DateTime<Utc>> {
    pod.metadata.creation_timestamp.as_ref().map(|t| t.0)
}

pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status.as_ref().and_then(|s| s.pod_ip.as_deref())
}
