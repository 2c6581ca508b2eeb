mod common;

use common::{Harness, NS};
use proptest::prelude::*;
use sandbox_api::{condition_types, labels, CapacitySpec, ConditionStatus};
use sandbox_controller::Reconciler;
use sandbox_testing::{fixtures, Action};

fn creates(actions: &[Action]) -> usize {
    actions
        .iter()
        .filter(|a| matches!(a, Action::CreatePod(_)))
        .count()
}

#[tokio::test]
async fn test_pool_fills_to_buffer() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(1, 10, 3, 5)));

    h.converge_pool("warm").await;

    let pods = h.pool_pods("warm");
    assert_eq!(pods.len(), 3);
    assert!(pods.iter().all(|pod| pod.metadata.name.as_deref().unwrap().starts_with("warm-")));
    assert!(pods.iter().all(|pod| labels::template_hash(pod).is_some()));

    let status = h.cluster.pool_status(NS, "warm").unwrap();
    assert_eq!(status.total, 3);
    assert_eq!(status.available, 3);
    assert_eq!(status.allocated, 0);
    assert_eq!(status.total_ready, 3);
    assert_eq!(status.observed_generation, Some(1));
    let ready = status
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::READY)
        .unwrap();
    assert_eq!(ready.status, ConditionStatus::True);
}

fn ready_condition(h: &Harness, pool: &str) -> sandbox_api::Condition {
    h.cluster
        .pool_status(NS, pool)
        .unwrap()
        .conditions
        .into_iter()
        .find(|c| c.type_ == condition_types::READY)
        .unwrap()
}

#[tokio::test]
async fn test_buffer_capped_by_pool_max_is_reported() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 2, 3, 3)));

    h.converge_pool("warm").await;

    assert_eq!(h.pool_pods("warm").len(), 2);
    let ready = ready_condition(&h, "warm");
    assert_eq!(ready.status, ConditionStatus::True);
    assert_eq!(ready.reason, "BufferCapped");
    assert!(ready.message.contains("2 of 3"));

    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 3, 3, 3)));
    h.converge_pool("warm").await;
    assert_eq!(ready_condition(&h, "warm").reason, "Converged");
}

#[tokio::test]
async fn test_scale_down_skips_pod_claimed_after_cache_read() {
    let h = Harness::new();
    h.cluster
        .apply_pod(fixtures::pool_pod(NS, "warm-a", "warm", true));
    h.cluster
        .apply_pod(fixtures::pool_pod(NS, "warm-b", "warm", true));
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 5, 0, 1)));
    h.cluster
        .apply_batch_sandbox(fixtures::pooled_batch_sandbox(NS, "job", "warm", 1));
    h.cluster.freeze_cache();

    // The claim lands while the pool still reads the old snapshot, where
    // warm-a is the oldest unassigned pod.
    h.reconcile_batch("job").await;
    let claimed = h.cluster.pod(NS, "warm-a").unwrap();
    assert_eq!(labels::assigned_to(&claimed), Some("job"));
    h.reconcile_pool("warm").await;

    let claimed = h.cluster.pod(NS, "warm-a").unwrap();
    assert_eq!(labels::assigned_to(&claimed), Some("job"));
    assert!(!h.cluster.actions().contains(&Action::DeletePod("warm-a".into())));

    h.cluster.unfreeze_cache();
    h.reconcile_pool("warm").await;
    assert_eq!(h.pool_pods("warm").len(), 2);
    assert_eq!(h.assigned_to("job").len(), 1);
}

#[tokio::test]
async fn test_zero_sized_pool_creates_nothing() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "empty", CapacitySpec::new(0, 0, 2, 3)));

    h.converge_pool("empty").await;

    assert!(h.pool_pods("empty").is_empty());
    assert_eq!(creates(&h.cluster.actions()), 0);
    assert_eq!(h.cluster.pool_status(NS, "empty").unwrap().total, 0);
}

#[tokio::test]
async fn test_stale_cache_does_not_double_create() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(2, 5, 2, 3)));
    h.cluster.freeze_cache();

    h.reconcile_pool("warm").await;
    h.reconcile_pool("warm").await;
    h.reconcile_pool("warm").await;
    assert_eq!(creates(&h.cluster.actions()), 2);

    h.cluster.sync();
    h.reconcile_pool("warm").await;
    assert_eq!(creates(&h.cluster.actions()), 2);
    assert_eq!(h.pool_pods("warm").len(), 2);
}

#[tokio::test]
async fn test_converged_pool_issues_no_writes() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 4, 2, 2)));
    h.converge_pool("warm").await;
    h.cluster.clear_actions();

    h.reconcile_pool("warm").await;
    h.reconcile_pool("warm").await;

    assert!(h.cluster.actions().is_empty());
}

#[tokio::test]
async fn test_pool_refills_after_claims() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 10, 2, 4)));
    h.converge_pool("warm").await;

    h.cluster
        .apply_batch_sandbox(fixtures::pooled_batch_sandbox(NS, "job", "warm", 2));
    h.reconcile_batch("job").await;
    assert_eq!(h.assigned_to("job").len(), 2);

    h.converge_pool("warm").await;

    let status = h.cluster.pool_status(NS, "warm").unwrap();
    assert_eq!(status.total, 4);
    assert_eq!(status.allocated, 2);
    assert_eq!(status.available, 2);
}

#[tokio::test]
async fn test_scale_down_never_touches_assigned_pods() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 10, 4, 4)));
    h.converge_pool("warm").await;
    h.cluster
        .apply_batch_sandbox(fixtures::pooled_batch_sandbox(NS, "job", "warm", 2));
    h.reconcile_batch("job").await;
    h.converge_pool("warm").await;
    assert_eq!(h.pool_pods("warm").len(), 6);

    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 3, 0, 1)));
    h.converge_pool("warm").await;

    // Three unassigned pods go; the assigned pair stays.
    let pods = h.pool_pods("warm");
    assert_eq!(h.assigned_to("job").len(), 2);
    assert_eq!(pods.len(), 3);
    let status = h.cluster.pool_status(NS, "warm").unwrap();
    assert_eq!(status.available, 1);
}

#[tokio::test]
async fn test_scale_down_prefers_outdated_template() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 10, 2, 2)));
    h.converge_pool("warm").await;
    let old: Vec<String> = h
        .pool_pods("warm")
        .iter()
        .map(|pod| labels::pod_name(pod).to_string())
        .collect();

    let mut pool = fixtures::pool(NS, "warm", CapacitySpec::new(0, 10, 3, 3));
    pool.spec.template = Some(fixtures::pod_template("sandbox:v2"));
    h.cluster.apply_pool(pool.clone());
    h.converge_pool("warm").await;
    let fresh: Vec<String> = h
        .pool_pods("warm")
        .iter()
        .map(|pod| labels::pod_name(pod).to_string())
        .filter(|name| !old.contains(name))
        .collect();
    assert_eq!(fresh.len(), 1);

    pool.spec.capacity_spec = CapacitySpec::new(0, 10, 1, 1);
    h.cluster.apply_pool(pool);
    h.converge_pool("warm").await;

    let remaining: Vec<String> = h
        .pool_pods("warm")
        .iter()
        .map(|pod| labels::pod_name(pod).to_string())
        .collect();
    assert_eq!(remaining, fresh);
}

#[tokio::test]
async fn test_deleted_pool_removes_its_pods() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(2, 4, 0, 4)));
    h.converge_pool("warm").await;
    assert_eq!(h.pool_pods("warm").len(), 2);

    h.cluster.delete_pool(NS, "warm");
    h.reconcile_pool("warm").await;

    assert!(h.pool_pods("warm").is_empty());
}

#[tokio::test]
async fn test_invalid_capacity_is_rejected_without_writes() {
    let h = Harness::new();
    h.cluster
        .apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(5, 2, 0, 1)));

    let err = h.pools.reconcile(NS, "warm", &h.ctx).await.unwrap_err();

    assert!(!err.is_transient());
    assert_eq!(err.condition_type(), condition_types::INVALID_CAPACITY);
    assert!(h.cluster.actions().is_empty());
}

fn capacity() -> impl Strategy<Value = CapacitySpec> {
    (0..4i32, 0..5i32, 0..4i32, 0..5i32).prop_map(|(min, extra, bmin, bextra)| {
        CapacitySpec::new(min, min + extra, bmin, bmin + bextra)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_converged_pool_respects_bounds(capacity in capacity(), claimed in 0..3i32) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (total, available) = runtime.block_on(async {
            let h = Harness::new();
            h.cluster.apply_pool(fixtures::pool(NS, "warm", capacity));
            h.converge_pool("warm").await;
            h.cluster
                .apply_batch_sandbox(fixtures::pooled_batch_sandbox(NS, "job", "warm", claimed));
            h.reconcile_batch("job").await;
            h.converge_pool("warm").await;

            let status = h.cluster.pool_status(NS, "warm").unwrap();
            (status.total, status.available)
        });

        prop_assert!(total >= capacity.pool_min);
        prop_assert!(total <= capacity.pool_max);
        prop_assert!(available >= capacity.buffer_min.min(capacity.pool_max - (total - available)));
        prop_assert!(available <= capacity.buffer_max.max(capacity.pool_min));
    }
}
