//! Deduplicating, rate-limited work queue.
//!
//! Semantics follow the classic controller work queue:
//! - A key is queued at most once (`dirty`).
//! - A key handed to a worker is `processing` until [`WorkQueue::done`];
//!   adding it meanwhile marks it dirty, and `done` queues it again. Two
//!   workers never hold the same key.
//! - Failures are counted per key and turned into exponential delays until
//!   [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sandbox_reconcile::BackoffPolicy;
use tokio::sync::Notify;

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    requeues: HashMap<K, u32>,
    shutting_down: bool,
}

impl<K> Default for State<K> {
    fn default() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            requeues: HashMap::new(),
            shutting_down: false,
        }
    }
}

#[derive(Debug)]
struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.notify.notify_one();
    }
}

/// Work queue shared by the event handlers and the workers.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    /// Queue a key unless it is already waiting.
    pub fn add(&self, key: K) {
        self.inner.add(key);
    }

    /// Queue a key once `delay` has passed.
    pub fn add_after(&self, key: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.add(key);
        });
    }

    /// Queue a key after its backoff delay and count the failure. Returns
    /// the delay used.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut state = self.inner.lock();
            let count = state.requeues.entry(key.clone()).or_insert(0);
            let attempt = *count;
            *count += 1;
            attempt
        };
        let delay = self.inner.backoff.delay(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Failures counted for a key since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner.lock().requeues.get(key).copied().unwrap_or(0)
    }

    /// Reset the failure count of a key.
    pub fn forget(&self, key: &K) {
        self.inner.lock().requeues.remove(key);
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the key until it calls [`Self::done`].
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Finish processing a key. Re-queues it if it was added meanwhile.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and ignore new ones. Wakes every waiting
    /// worker.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
