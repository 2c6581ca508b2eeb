//! Ordinal assignment over a BatchSandbox's pods.

use k8s_openapi::api::core::v1::Pod;
use sandbox_api::labels;

use crate::ordering::{pod_index_map, MultiPodSorter};

/// Which pod serves which ordinal.
#[derive(Debug, Default)]
pub struct Assignment<'a> {
    /// One entry per replica; `None` marks a missing ordinal.
    pub slots: Vec<Option<&'a Pod>>,
    /// Pods with no ordinal left to serve.
    pub excess: Vec<&'a Pod>,
}

impl Assignment<'_> {
    /// Ordinals without a pod, ascending.
    pub fn missing(&self) -> Vec<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(i, _)| i)
            .collect()
    }
}

/// Assign ordinals `0..replicas` to `pods`.
///
/// Pods are walked in index-then-name order. A pod whose recorded index is
/// in range and not yet taken keeps it; the remaining pods fill the lowest
/// free ordinals in walk order; whatever is left is excess.
pub fn assign_ordinals<'a>(pods: &[&'a Pod], replicas: usize) -> Assignment<'a> {
    let mut ordered = pods.to_vec();
    MultiPodSorter::index_then_name(pod_index_map(&ordered)).sort(&mut ordered);

    let mut slots: Vec<Option<&'a Pod>> = vec![None; replicas];
    let mut unplaced = Vec::new();
    for pod in ordered {
        match labels::pod_index(pod) {
            Some(i) if i < replicas && slots[i].is_none() => slots[i] = Some(pod),
            _ => unplaced.push(pod),
        }
    }

    let mut unplaced = unplaced.into_iter();
    for slot in slots.iter_mut().filter(|slot| slot.is_none()) {
        match unplaced.next() {
            Some(pod) => *slot = Some(pod),
            None => break,
        }
    }

    Assignment {
        slots,
        excess: unplaced.collect(),
    }
}
