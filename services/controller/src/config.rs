//! Configuration for the controller.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

/// Controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of reconcile workers.
    pub workers: usize,

    /// Transient failures tolerated per key before it is parked.
    pub max_retries: u32,

    /// First retry delay.
    pub backoff_base: Duration,

    /// Retry delay cap.
    pub backoff_max: Duration,

    /// Random spread applied to retry delays, as a fraction of the delay.
    pub backoff_jitter: f64,

    /// Delay before re-checking a BatchSandbox whose pool is short.
    pub pool_retry: Duration,

    /// Namespace to watch; all namespaces when unset.
    pub watch_namespace: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// How long to wait for workers after shutdown is signalled.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            max_retries: 15,
            backoff_base: Duration::from_millis(5),
            backoff_max: Duration::from_secs(300),
            backoff_jitter: 0.0,
            pool_retry: Duration::from_secs(5),
            watch_namespace: None,
            log_level: "info".to_string(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let workers = parse_var("SANDBOX_WORKERS", defaults.workers)?;
        anyhow::ensure!(workers > 0, "SANDBOX_WORKERS must be at least 1");

        let max_retries = parse_var("SANDBOX_MAX_RETRIES", defaults.max_retries)?;

        let backoff_base = Duration::from_millis(parse_var(
            "SANDBOX_BACKOFF_BASE_MS",
            defaults.backoff_base.as_millis() as u64,
        )?);

        let backoff_max = Duration::from_secs(parse_var(
            "SANDBOX_BACKOFF_MAX_SECS",
            defaults.backoff_max.as_secs(),
        )?);

        let backoff_jitter = parse_var("SANDBOX_BACKOFF_JITTER", defaults.backoff_jitter)?;
        anyhow::ensure!(
            (0.0..=1.0).contains(&backoff_jitter),
            "SANDBOX_BACKOFF_JITTER must be between 0 and 1"
        );

        let pool_retry = Duration::from_secs(parse_var(
            "SANDBOX_POOL_RETRY_SECS",
            defaults.pool_retry.as_secs(),
        )?);

        let watch_namespace = std::env::var("SANDBOX_WATCH_NAMESPACE")
            .ok()
            .filter(|ns| !ns.is_empty());

        let log_level =
            std::env::var("SANDBOX_LOG_LEVEL").unwrap_or_else(|_| defaults.log_level.clone());

        let shutdown_timeout = Duration::from_secs(parse_var(
            "SANDBOX_SHUTDOWN_TIMEOUT_SECS",
            defaults.shutdown_timeout.as_secs(),
        )?);

        Ok(Self {
            workers,
            max_retries,
            backoff_base,
            backoff_max,
            backoff_jitter,
            pool_retry,
            watch_namespace,
            log_level,
            shutdown_timeout,
        })
    }
}
