//! In-flight intent tracking.
//!
//! The cache lags behind the writes the controller issues. Until a create
//! shows up (or a delete disappears) the intent is remembered here and
//! folded into the next plan, so two passes over the same stale cache never
//! double-issue.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use sandbox_api::{labels, ObjectKey};
use tokio::time::Instant;

/// How long an unobserved intent is trusted.
pub const EXPECTATION_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Default)]
struct Pending {
    creates: HashMap<String, Instant>,
    deletes: HashMap<String, Instant>,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.deletes.is_empty()
    }
}

/// Intents still in flight for one pool, after reconciling with the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InFlight {
    pub creates: Vec<String>,
    pub deletes: Vec<String>,
}

impl InFlight {
    pub fn is_deleting(&self, name: &str) -> bool {
        self.deletes.iter().any(|d| d == name)
    }
}

/// Per-pool pending creates and deletes.
#[derive(Debug)]
pub struct Expectations {
    ttl: Duration,
    pending: Mutex<HashMap<ObjectKey, Pending>>,
}

impl Default for Expectations {
    fn default() -> Self {
        Self::new(EXPECTATION_TTL)
    }
}

impl Expectations {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ObjectKey, Pending>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn expect_create(&self, key: &ObjectKey, name: &str) {
        self.lock()
            .entry(key.clone())
            .or_default()
            .creates
            .insert(name.to_string(), Instant::now());
    }

    pub fn expect_delete(&self, key: &ObjectKey, name: &str) {
        self.lock()
            .entry(key.clone())
            .or_default()
            .deletes
            .insert(name.to_string(), Instant::now());
    }

    /// Drop an intent that failed to issue.
    pub fn cancel_create(&self, key: &ObjectKey, name: &str) {
        if let Some(pending) = self.lock().get_mut(key) {
            pending.creates.remove(name);
        }
    }

    pub fn cancel_delete(&self, key: &ObjectKey, name: &str) {
        if let Some(pending) = self.lock().get_mut(key) {
            pending.deletes.remove(name);
        }
    }

    /// Settle intents against the pods the cache shows for the pool and
    /// return what is still in flight.
    ///
    /// A create is settled once its pod is visible. A delete is settled once
    /// its pod is gone or terminating. Either expires after the TTL.
    pub fn observe(&self, key: &ObjectKey, pods: &[&Pod]) -> InFlight {
        let mut all = self.lock();
        let Some(pending) = all.get_mut(key) else {
            return InFlight::default();
        };
        let now = Instant::now();
        let ttl = self.ttl;
        let live = |name: &str| {
            pods.iter()
                .find(|pod| labels::pod_name(pod) == name)
                .map(|pod| !labels::is_terminating(pod))
        };

        pending
            .creates
            .retain(|name, at| now.duration_since(*at) < ttl && live(name).is_none());
        pending
            .deletes
            .retain(|name, at| now.duration_since(*at) < ttl && live(name) == Some(true));

        let mut in_flight = InFlight {
            creates: pending.creates.keys().cloned().collect(),
            deletes: pending.deletes.keys().cloned().collect(),
        };
        in_flight.creates.sort();
        in_flight.deletes.sort();

        if pending.is_empty() {
            all.remove(key);
        }
        in_flight
    }

    /// Forget everything about a pool.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().remove(key);
    }
}
