//! Sandbox Controller
//!
//! Watches Pools, BatchSandboxes and the pods they manage, and drives the
//! reconcile engine until interrupted.

use std::sync::Arc;

use anyhow::Result;
use sandbox_controller::{backend, config, ReconcileEngine, WorkQueue};
use sandbox_reconcile::BackoffPolicy;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = config::Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to SANDBOX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting sandbox controller");
    info!(
        workers = config.workers,
        max_retries = config.max_retries,
        namespace = config.watch_namespace.as_deref().unwrap_or("*"),
        "Configuration loaded"
    );

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create Kubernetes client");
            return Err(e.into());
        }
    };

    // Create shutdown channel for graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let queue = WorkQueue::new(BackoffPolicy {
        jitter: config.backoff_jitter,
        ..BackoffPolicy::new(config.backoff_base, config.backoff_max)
    });
    let mut watchers = JoinSet::new();
    let cache = backend::start_watchers(
        client.clone(),
        config.watch_namespace.as_deref(),
        queue.clone(),
        shutdown_rx.clone(),
        &mut watchers,
    )
    .await?;

    let engine = Arc::new(ReconcileEngine::new(
        queue,
        cache,
        Arc::new(backend::KubeClient::new(client)),
        &config,
    ));
    let engine_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            engine.run(shutdown_rx).await;
        }
    });

    // Wait for shutdown signal (Ctrl+C)
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        Some(result) = watchers.join_next() => {
            if let Err(e) = result {
                error!(error = %e, "Watcher task panicked");
            } else {
                warn!("Watcher exited unexpectedly");
            }
        }
    }

    // Signal shutdown to the engine and watchers
    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    if let Err(e) = tokio::time::timeout(config.shutdown_timeout, engine_handle).await {
        warn!(error = %e, "Reconcile engine did not shut down in time");
    }
    watchers.abort_all();

    info!("Sandbox controller shutdown complete");
    Ok(())
}
