//! Pure capacity planning.
//!
//! [`plan`] is a function of the capacity bounds, the pods the cache shows
//! for the pool and the intents still in flight. It never looks at the
//! event that triggered the pass.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Pod;
use sandbox_api::{labels, CapacitySpec};

use crate::ordering::{
    creation_time_sorter, outdated_template_sorter, pod_name_sorter, MultiPodSorter,
};

/// Reject bounds that contradict each other.
pub fn validate(capacity: &CapacitySpec) -> Result<(), String> {
    let CapacitySpec {
        pool_min,
        pool_max,
        buffer_min,
        buffer_max,
    } = *capacity;
    if [pool_min, pool_max, buffer_min, buffer_max]
        .iter()
        .any(|v| *v < 0)
    {
        return Err(format!(
            "bounds must be non-negative (poolMin {pool_min}, poolMax {pool_max}, \
             bufferMin {buffer_min}, bufferMax {buffer_max})"
        ));
    }
    if pool_min > pool_max {
        return Err(format!("poolMin {pool_min} exceeds poolMax {pool_max}"));
    }
    if buffer_min > buffer_max {
        return Err(format!("bufferMin {buffer_min} exceeds bufferMax {buffer_max}"));
    }
    Ok(())
}

/// Counts over the pool's live pods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolCounts {
    /// Live pods plus creates not yet observed.
    pub total: usize,
    /// Pods serving a BatchSandbox replica.
    pub allocated: usize,
    /// Ready and unassigned.
    pub available: usize,
    /// Unassigned and not ready yet, including creates not yet observed.
    pub starting: usize,
    /// Ready, assigned or not.
    pub ready: usize,
}

impl PoolCounts {
    fn observe<'a>(pods: impl IntoIterator<Item = &'a Pod>, in_flight_creates: usize) -> Self {
        let mut counts = PoolCounts {
            total: in_flight_creates,
            starting: in_flight_creates,
            ..Default::default()
        };
        for pod in pods {
            let ready = labels::is_pod_ready(pod);
            let assigned = labels::assigned_to(pod).is_some();
            counts.total += 1;
            counts.ready += usize::from(ready);
            match (assigned, ready) {
                (true, _) => counts.allocated += 1,
                (false, true) => counts.available += 1,
                (false, false) => counts.starting += 1,
            }
        }
        counts
    }
}

/// The intents for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapacityPlan {
    pub counts: PoolCounts,
    /// Number of pods to create.
    pub create: usize,
    /// Pods to delete, in deletion order.
    pub delete: Vec<String>,
}

impl CapacityPlan {
    /// Total the pool converges to once this plan lands.
    pub fn total_desired(&self) -> usize {
        self.counts.total + self.create - self.delete.len()
    }

    pub fn is_noop(&self) -> bool {
        self.create == 0 && self.delete.is_empty()
    }
}

/// Compute create/delete intents.
///
/// `pods` must already exclude terminating pods and pods with a delete in
/// flight. `in_flight_creates` counts creates issued but not yet visible.
/// `current_hash` is the hash of the pool's current template; pods built
/// from another template are deleted first.
pub fn plan(
    capacity: &CapacitySpec,
    pods: &[&Pod],
    in_flight_creates: usize,
    current_hash: &str,
) -> CapacityPlan {
    let counts = PoolCounts::observe(pods.iter().copied(), in_flight_creates);
    let pool_min = capacity.pool_min.max(0) as usize;
    let pool_max = capacity.pool_max.max(0) as usize;
    let buffer_min = capacity.buffer_min.max(0) as usize;
    let buffer_max = capacity.buffer_max.max(0) as usize;

    let headroom = pool_max.saturating_sub(counts.total);
    let below_min = pool_min.saturating_sub(counts.total);
    let below_buffer = buffer_min.saturating_sub(counts.available + counts.starting);
    let create = below_min.max(below_buffer).min(headroom);
    if create > 0 {
        return CapacityPlan {
            counts,
            create,
            delete: Vec::new(),
        };
    }

    let above_max = counts.total.saturating_sub(pool_max);
    let above_buffer = counts.available.saturating_sub(buffer_max);
    let floor = counts.total.saturating_sub(pool_min);
    let want = above_max.max(above_buffer).min(floor);
    if want == 0 {
        return CapacityPlan {
            counts,
            ..Default::default()
        };
    }

    let mut victims: Vec<&Pod> = pods
        .iter()
        .copied()
        .filter(|pod| labels::assigned_to(pod).is_none() && labels::is_pod_ready(pod))
        .collect();
    victim_order(current_hash).sort(&mut victims);

    CapacityPlan {
        counts,
        create: 0,
        delete: victims
            .into_iter()
            .take(want)
            .map(|pod| labels::pod_name(pod).to_string())
            .collect(),
    }
}

/// Outdated template first, then oldest, then by name.
fn victim_order(current_hash: &str) -> MultiPodSorter {
    MultiPodSorter::new()
        .then(outdated_template_sorter(current_hash.to_string()))
        .then(creation_time_sorter)
        .then(pod_name_sorter)
}

/// Deterministic names for `count` new pods: `<pool>-<hash8>-<n>` filling
/// the lowest free slots.
pub fn pod_names(
    pool: &str,
    short_hash: &str,
    taken: &HashSet<String>,
    count: usize,
) -> Vec<String> {
    (0..)
        .map(|n| format!("{pool}-{short_hash}-{n}"))
        .filter(|name| !taken.contains(name))
        .take(count)
        .collect()
}
