//! Total ordering over pods.
//!
//! Ordinal assignment, scale-down victim selection and status rendering all
//! walk pods in this order, so it must be reproducible across passes over
//! the same observed state. Sorters compose into a [`MultiPodSorter`] that
//! is applied with a stable sort.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::collections::HashMap;

use k8s_openapi::api::core::v1::Pod;
use sandbox_api::labels;

/// A pairwise pod comparator.
pub type PodSorter = Box<dyn Fn(&Pod, &Pod) -> Ordering + Send + Sync>;

/// Pods present in `index` sort before pods absent from it; present pods
/// sort by ascending index; two absent pods tie.
pub fn with_pod_index_sorter(index: HashMap<String, usize>) -> PodSorter {
    Box::new(move |a, b| {
        match (
            index.get(labels::pod_name(a)),
            index.get(labels::pod_name(b)),
        ) {
            (Some(ia), Some(ib)) => ia.cmp(ib),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    })
}

/// Lexicographic order on pod name.
pub fn pod_name_sorter(a: &Pod, b: &Pod) -> Ordering {
    labels::pod_name(a).cmp(labels::pod_name(b))
}

/// Oldest creation timestamp first; pods without one sort last.
pub fn creation_time_sorter(a: &Pod, b: &Pod) -> Ordering {
    match (labels::creation_time(a), labels::creation_time(b)) {
        (Some(ta), Some(tb)) => ta.cmp(&tb),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Pods built from a template other than `current_hash` sort first.
pub fn outdated_template_sorter(current_hash: String) -> PodSorter {
    Box::new(move |a, b| {
        let outdated = |pod: &Pod| labels::template_hash(pod) != Some(current_hash.as_str());
        outdated(b).cmp(&outdated(a))
    })
}

/// Build the ordinal index of a pod set from its index annotations.
pub fn pod_index_map<P: Borrow<Pod>>(pods: &[P]) -> HashMap<String, usize> {
    pods.iter()
        .filter_map(|pod| {
            let pod = pod.borrow();
            labels::pod_index(pod).map(|i| (labels::pod_name(pod).to_string(), i))
        })
        .collect()
}

/// Chain of sorters evaluated left to right; the first non-equal result
/// wins.
#[derive(Default)]
pub struct MultiPodSorter {
    sorters: Vec<PodSorter>,
}

impl MultiPodSorter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sorter to the chain.
    pub fn then<F>(mut self, sorter: F) -> Self
    where
        F: Fn(&Pod, &Pod) -> Ordering + Send + Sync + 'static,
    {
        self.sorters.push(Box::new(sorter));
        self
    }

    /// The ordering every pod walk uses: known ordinals first by ordinal,
    /// then the rest by name.
    pub fn index_then_name(index: HashMap<String, usize>) -> Self {
        Self::new()
            .then(with_pod_index_sorter(index))
            .then(pod_name_sorter)
    }

    pub fn compare(&self, a: &Pod, b: &Pod) -> Ordering {
        self.sorters
            .iter()
            .map(|sorter| sorter(a, b))
            .find(|ordering| ordering.is_ne())
            .unwrap_or(Ordering::Equal)
    }

    /// Stable sort in place.
    pub fn sort<P: Borrow<Pod>>(&self, pods: &mut [P]) {
        pods.sort_by(|a, b| self.compare(a.borrow(), b.borrow()));
    }
}
