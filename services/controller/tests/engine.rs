use std::sync::Arc;
use std::time::Duration;

use sandbox_api::{condition_types, CapacitySpec, ClusterError, ConditionStatus, ObjectKey};
use sandbox_controller::batch::BatchReconciler;
use sandbox_controller::capacity::CapacityController;
use sandbox_controller::{EngineConfig, ReconcileContext, ReconcileEngine, WorkQueue};
use sandbox_reconcile::BackoffPolicy;
use sandbox_testing::{fixtures, FakeCluster, Op};
use serde_json::json;
use tokio::sync::watch;

const NS: &str = "sandboxes";

fn engine(cluster: &FakeCluster, config: EngineConfig) -> Arc<ReconcileEngine> {
    let shared = Arc::new(cluster.clone());
    let queue = WorkQueue::new(BackoffPolicy::default());
    Arc::new(ReconcileEngine::with_reconcilers(
        queue,
        Arc::new(CapacityController::new(shared.clone(), shared.clone())),
        Arc::new(
            BatchReconciler::new(shared.clone(), shared).with_pool_retry(Duration::from_secs(3)),
        ),
        config,
    ))
}

fn config(workers: usize, max_retries: u32) -> EngineConfig {
    EngineConfig {
        workers,
        max_retries,
    }
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_retries() {
    let cluster = FakeCluster::new();
    cluster.apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(2, 4, 0, 4)));
    for _ in 0..3 {
        cluster.fail_next(Op::CreatePod, ClusterError::Throttled("slow down".into()));
    }
    let engine = engine(&cluster, config(1, 2));
    let key = ObjectKey::pool(NS, "warm");
    let ctx = ReconcileContext::detached();

    engine.queue().add(key.clone());
    assert!(engine.process_next(&ctx).await);
    assert_eq!(engine.queue().num_requeues(&key), 1);
    assert!(engine.process_next(&ctx).await);
    assert_eq!(engine.queue().num_requeues(&key), 2);
    assert!(engine.process_next(&ctx).await);

    assert_eq!(engine.queue().num_requeues(&key), 0);
    assert!(engine.queue().is_empty());
    let status = cluster.pool_status(NS, "warm").unwrap();
    let failed = status
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::RECONCILE_FAILED)
        .unwrap();
    assert_eq!(failed.status, ConditionStatus::True);
    assert_eq!(failed.reason, "RetriesExhausted");
    assert_eq!(failed.retry_count, Some(2));
    assert!(failed.message.contains("slow down"));

    // The next event starts over and a clean pass clears the condition.
    engine.queue().add(key);
    assert!(engine.process_next(&ctx).await);
    assert_eq!(cluster.pods(NS).len(), 2);
    let status = cluster.pool_status(NS, "warm").unwrap();
    assert!(status
        .conditions
        .iter()
        .all(|c| c.type_ != condition_types::RECONCILE_FAILED));
}

#[tokio::test]
async fn test_permanent_failure_is_recorded_once() {
    let cluster = FakeCluster::new();
    let mut bs = fixtures::pooled_batch_sandbox(NS, "job", "warm", 2);
    bs.spec.task_template = Some(fixtures::task_template(&["python"], None));
    bs.spec.shard_task_patches = Some(vec![json!({"spec": {"process": {"command": 7}}})]);
    cluster.apply_batch_sandbox(bs);
    let engine = engine(&cluster, config(1, 5));
    let key = ObjectKey::batch_sandbox(NS, "job");

    engine.queue().add(key.clone());
    assert!(engine.process_next(&ReconcileContext::detached()).await);

    assert!(engine.queue().is_empty());
    assert_eq!(engine.queue().num_requeues(&key), 0);
    let status = cluster.batch_sandbox_status(NS, "job").unwrap();
    let failed = status
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::TASK_GENERATION_FAILED)
        .unwrap();
    assert_eq!(failed.status, ConditionStatus::True);
    assert!(failed.message.contains("index 0"));
    let ready = status
        .conditions
        .iter()
        .find(|c| c.type_ == condition_types::READY)
        .unwrap();
    assert_eq!(ready.status, ConditionStatus::False);
    assert!(cluster.pods(NS).is_empty());
}

#[tokio::test]
async fn test_invalid_capacity_is_recorded() {
    let cluster = FakeCluster::new();
    cluster.apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(0, 4, 3, 1)));
    let engine = engine(&cluster, config(1, 5));

    engine.queue().add(ObjectKey::pool(NS, "warm"));
    assert!(engine.process_next(&ReconcileContext::detached()).await);

    let status = cluster.pool_status(NS, "warm").unwrap();
    assert!(status.conditions.iter().any(|c| {
        c.type_ == condition_types::INVALID_CAPACITY && c.status == ConditionStatus::True
    }));
    assert!(cluster.pods(NS).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_short_pool_requeues_after_delay() {
    let cluster = FakeCluster::new();
    cluster.apply_batch_sandbox(fixtures::pooled_batch_sandbox(NS, "job", "warm", 1));
    let engine = engine(&cluster, config(1, 5));

    engine.queue().add(ObjectKey::batch_sandbox(NS, "job"));
    assert!(engine.process_next(&ReconcileContext::detached()).await);
    assert!(engine.queue().is_empty());

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert_eq!(engine.queue().len(), 1);
}

#[tokio::test]
async fn test_run_converges_and_shuts_down() {
    let cluster = FakeCluster::new();
    cluster.apply_pool(fixtures::pool(NS, "warm", CapacitySpec::new(3, 5, 0, 5)));
    cluster.apply_batch_sandbox(fixtures::direct_batch_sandbox(NS, "job", 2));
    let engine = engine(&cluster, config(3, 5));
    let queue = engine.queue().clone();
    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(Arc::clone(&engine).run(rx));

    queue.add(ObjectKey::pool(NS, "warm"));
    queue.add(ObjectKey::batch_sandbox(NS, "job"));

    let mut converged = false;
    for _ in 0..200 {
        if cluster.pods(NS).len() == 5 {
            converged = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(converged);

    shutdown.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(queue.is_shutting_down());

    // Nothing is picked up after shutdown.
    queue.add(ObjectKey::pool(NS, "warm"));
    assert!(!engine.process_next(&ReconcileContext::detached()).await);
}
