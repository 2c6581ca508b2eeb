//! The reconcile engine.
//!
//! A fixed set of workers drains one shared [`WorkQueue`]. Each key is
//! reconciled by the reconciler for its kind, always from the full observed
//! state. Failures stay with their key:
//! - Transient errors are retried with per-key backoff until the retry
//!   budget is spent, then recorded as a `ReconcileFailed` condition.
//! - Permanent errors are recorded on the object's status straight away and
//!   not retried until the next event for the key.

pub mod events;
mod queue;

use std::sync::Arc;

use sandbox_api::{
    condition_types, ClusterClient, Condition, ConditionStatus, ObjectKey, ResourceCache,
    ResourceKind,
};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

pub use queue::WorkQueue;

use crate::batch::BatchReconciler;
use crate::capacity::CapacityController;
use crate::config::Config;
use crate::context::{ReconcileContext, Reconciler, Requeue};
use crate::error::{ControllerError, ControllerResult};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub workers: usize,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 15,
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            workers: config.workers,
            max_retries: config.max_retries,
        }
    }
}

/// Drains the work queue with a pool of workers.
pub struct ReconcileEngine {
    queue: WorkQueue<ObjectKey>,
    pools: Arc<dyn Reconciler>,
    batches: Arc<dyn Reconciler>,
    config: EngineConfig,
}

impl ReconcileEngine {
    /// Build an engine with the standard reconcilers over the given
    /// collaborators.
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        cache: Arc<dyn ResourceCache>,
        client: Arc<dyn ClusterClient>,
        config: &Config,
    ) -> Self {
        let pools = CapacityController::new(cache.clone(), client.clone());
        let batches = BatchReconciler::new(cache, client).with_pool_retry(config.pool_retry);
        Self::with_reconcilers(
            queue,
            Arc::new(pools),
            Arc::new(batches),
            EngineConfig::from(config),
        )
    }

    pub fn with_reconcilers(
        queue: WorkQueue<ObjectKey>,
        pools: Arc<dyn Reconciler>,
        batches: Arc<dyn Reconciler>,
        config: EngineConfig,
    ) -> Self {
        Self {
            queue,
            pools,
            batches,
            config,
        }
    }

    /// The queue event handlers feed.
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    fn reconciler(&self, kind: ResourceKind) -> &dyn Reconciler {
        match kind {
            ResourceKind::Pool => self.pools.as_ref(),
            ResourceKind::BatchSandbox => self.batches.as_ref(),
        }
    }

    /// Run the workers until shutdown is signalled, then wait for each to
    /// finish its in-flight key.
    #[instrument(skip(self, shutdown))]
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(workers = self.config.workers, "Starting reconcile engine");

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let engine = Arc::clone(&self);
            let ctx = ReconcileContext::new(shutdown.clone());
            workers.spawn(async move {
                while engine.process_next(&ctx).await {}
                debug!(worker = id, "Worker stopped");
            });
        }

        loop {
            if *shutdown.borrow() {
                break;
            }
            if shutdown.changed().await.is_err() {
                // Sender gone; nobody can signal us any more.
                break;
            }
        }

        info!("Reconcile engine shutting down");
        self.queue.shut_down();
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Worker task failed");
            }
        }
        info!("Reconcile engine stopped");
    }

    /// Take one key off the queue and reconcile it. Returns false once the
    /// queue is shut down.
    pub async fn process_next(&self, ctx: &ReconcileContext) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        match self.reconcile_key(&key, ctx).await {
            Ok(Requeue::Done) => self.queue.forget(&key),
            Ok(Requeue::After(delay)) => {
                self.queue.forget(&key);
                self.queue.add_after(key.clone(), delay);
            }
            Err(e) => self.handle_error(&key, e).await,
        }
        self.queue.done(&key);
        true
    }

    /// Reconcile one key with the reconciler for its kind.
    pub async fn reconcile_key(
        &self,
        key: &ObjectKey,
        ctx: &ReconcileContext,
    ) -> ControllerResult<Requeue> {
        self.reconciler(key.kind)
            .reconcile(&key.namespace, &key.name, ctx)
            .await
    }

    async fn handle_error(&self, key: &ObjectKey, err: ControllerError) {
        if err.is_transient() {
            let attempts = self.queue.num_requeues(key);
            if attempts < self.config.max_retries {
                let delay = self.queue.add_rate_limited(key.clone());
                warn!(
                    key = %key,
                    attempt = attempts + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Reconcile failed, retrying"
                );
                return;
            }

            error!(key = %key, attempts, error = %err, "Retries exhausted, giving up");
            let condition = Condition::new(
                condition_types::RECONCILE_FAILED,
                ConditionStatus::True,
                "RetriesExhausted",
                err.to_string(),
            )
            .with_retry_count(attempts);
            self.record(key, condition).await;
        } else {
            warn!(key = %key, error = %err, "Reconcile failed permanently");
            let condition = Condition::new(
                err.condition_type(),
                ConditionStatus::True,
                err.reason(),
                err.to_string(),
            );
            self.record(key, condition).await;
        }
        self.queue.forget(key);
    }

    async fn record(&self, key: &ObjectKey, condition: Condition) {
        if let Err(e) = self
            .reconciler(key.kind)
            .record_failure(&key.namespace, &key.name, condition)
            .await
        {
            error!(key = %key, error = %e, "Failed to record failure condition");
        }
    }
}
