//! Builders for pod intents.
//!
//! Every function here takes a cached snapshot by reference and returns a
//! new object; cached pods are never mutated in place.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Pod, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use sandbox_api::{labels, ResourceKind, Task};
use sandbox_reconcile::SpecHash;

/// Identity of the object a new pod belongs to.
pub struct PodOwner<'a> {
    pub kind: ResourceKind,
    pub name: &'a str,
    pub reference: Option<OwnerReference>,
}

/// Hash of a pod template, stamped on every pod built from it.
pub fn template_hash(template: &PodTemplateSpec) -> SpecHash {
    let json = serde_json::to_value(template).unwrap_or_default();
    SpecHash::from_json(&json)
}

/// Materialize a pod from a template.
pub fn pod_from_template(
    template: &PodTemplateSpec,
    namespace: &str,
    name: &str,
    owner: &PodOwner<'_>,
    hash: &SpecHash,
) -> Pod {
    let template_meta = template.metadata.clone().unwrap_or_default();

    let mut pod_labels = template_meta.labels.unwrap_or_default();
    pod_labels.insert(labels::OWNER_KIND.to_string(), owner.kind.to_string());
    pod_labels.insert(labels::OWNER_NAME.to_string(), owner.name.to_string());
    pod_labels.insert(labels::TEMPLATE_HASH.to_string(), hash.to_string());

    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(pod_labels),
            annotations: template_meta.annotations,
            owner_references: owner.reference.clone().map(|r| vec![r]),
            ..Default::default()
        },
        spec: template.spec.clone(),
        status: None,
    }
}

/// Encode a task for the executor annotation.
pub fn encode_task(task: &Task) -> Result<String, serde_json::Error> {
    serde_json::to_string(task)
}

/// Set `key` to `value` (or remove it for `None`). Returns true on change.
fn set_entry(map: &mut Option<BTreeMap<String, String>>, key: &str, value: Option<&str>) -> bool {
    match value {
        Some(value) => {
            let map = map.get_or_insert_with(BTreeMap::new);
            if map.get(key).map(String::as_str) == Some(value) {
                return false;
            }
            map.insert(key.to_string(), value.to_string());
            true
        }
        None => map
            .as_mut()
            .is_some_and(|map| map.remove(key).is_some()),
    }
}

/// The pod with its ordinal and task annotations set, or `None` when it
/// already carries them.
pub fn with_assignment(pod: &Pod, index: usize, task: Option<&str>) -> Option<Pod> {
    let mut updated = pod.clone();
    let index = index.to_string();
    let mut changed = set_entry(
        &mut updated.metadata.annotations,
        labels::INDEX_ANNOTATION,
        Some(&index),
    );
    changed |= set_entry(&mut updated.metadata.annotations, labels::TASK_ANNOTATION, task);
    changed.then_some(updated)
}

/// A pool pod claimed for `batch_sandbox` at `index`.
pub fn claim(pod: &Pod, batch_sandbox: &str, index: usize, task: Option<&str>) -> Pod {
    let mut claimed = with_assignment(pod, index, task).unwrap_or_else(|| pod.clone());
    set_entry(
        &mut claimed.metadata.labels,
        labels::ASSIGNED_TO,
        Some(batch_sandbox),
    );
    claimed
}

/// A pool pod handed back to its pool: assignment label, ordinal and task
/// removed.
pub fn release(pod: &Pod) -> Pod {
    let mut released = pod.clone();
    set_entry(&mut released.metadata.labels, labels::ASSIGNED_TO, None);
    set_entry(&mut released.metadata.annotations, labels::INDEX_ANNOTATION, None);
    set_entry(&mut released.metadata.annotations, labels::TASK_ANNOTATION, None);
    released
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_testing::fixtures;

    #[test]
    fn test_pod_from_template_stamps_owner_and_hash() {
        let template = fixtures::pod_template("img:1");
        let hash = template_hash(&template);
        let owner = PodOwner {
            kind: ResourceKind::Pool,
            name: "warm",
            reference: None,
        };

        let pod = pod_from_template(&template, "ns", "warm-abc-0", &owner, &hash);

        assert_eq!(labels::owner(&pod), Some((ResourceKind::Pool, "warm")));
        assert_eq!(labels::template_hash(&pod), Some(hash.as_str()));
        // template labels are kept
        assert_eq!(
            pod.metadata.labels.as_ref().unwrap().get("app").map(String::as_str),
            Some("sandbox")
        );
        assert_eq!(pod.metadata.namespace.as_deref(), Some("ns"));
    }

    #[test]
    fn test_template_hash_tracks_template() {
        assert_eq!(
            template_hash(&fixtures::pod_template("img:1")),
            template_hash(&fixtures::pod_template("img:1"))
        );
        assert_ne!(
            template_hash(&fixtures::pod_template("img:1")),
            template_hash(&fixtures::pod_template("img:2"))
        );
    }

    #[test]
    fn test_claim_then_release() {
        let pod = fixtures::pool_pod("ns", "warm-0", "warm", true);

        let claimed = claim(&pod, "bs", 3, Some("{}"));
        assert_eq!(labels::assigned_to(&claimed), Some("bs"));
        assert_eq!(labels::pod_index(&claimed), Some(3));
        assert_eq!(labels::task_annotation(&claimed), Some("{}"));

        let released = release(&claimed);
        assert_eq!(labels::assigned_to(&released), None);
        assert_eq!(labels::pod_index(&released), None);
        assert_eq!(labels::task_annotation(&released), None);
        assert_eq!(labels::owner(&released), Some((ResourceKind::Pool, "warm")));
    }

    #[test]
    fn test_with_assignment_is_none_when_unchanged() {
        let pod = fixtures::assigned_pod("ns", "warm-0", "warm", "bs", Some(1));

        assert!(with_assignment(&pod, 1, None).is_none());
        assert!(with_assignment(&pod, 2, None).is_some());

        let tasked = with_assignment(&pod, 1, Some("{\"name\":\"bs-1\"}")).unwrap();
        assert!(with_assignment(&tasked, 1, Some("{\"name\":\"bs-1\"}")).is_none());
        // dropping the task is a change
        assert!(with_assignment(&tasked, 1, None).is_some());
    }
}
