//! Deduplicating, rate-limited work queue
//!
//! Keys wait in FIFO order. A key is never handed to two workers at once: a
//! key added while it is being processed is parked as dirty and requeued
//! when the worker calls [`WorkQueue::done`].

use super::rate_limiter::RateLimiter;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::trace;

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    /// Keys that need processing: waiting in `queue` or parked behind
    /// `processing`
    dirty: HashSet<String>,
    processing: HashSet<String>,
    requeues: HashMap<String, u32>,
    shutting_down: bool,
}

struct Inner {
    name: String,
    state: Mutex<QueueState>,
    notify: Notify,
    rate_limiter: Box<dyn RateLimiter>,
}

/// Cloneable handle to a named work queue
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(name: impl Into<String>, rate_limiter: impl RateLimiter + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Mark a key as needing processing
    pub fn add(&self, key: &str) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(key) {
                return;
            }
            state.dirty.insert(key.to_string());
            if state.processing.contains(key) {
                return;
            }
            state.queue.push_back(key.to_string());
        }
        self.inner.notify.notify_one();
    }

    /// Add a key once `delay` has passed
    pub fn add_after(&self, key: &str, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        if self.is_shutting_down() {
            return;
        }
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Add a key after the delay the rate limiter asks for, counting a requeue
    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.rate_limiter.when(key);
        {
            let mut state = self.inner.state.lock();
            *state.requeues.entry(key.to_string()).or_insert(0) += 1;
        }
        trace!(queue = %self.inner.name, key, ?delay, "requeue");
        self.add_after(key, delay);
    }

    /// Stop tracking retries of a key
    pub fn forget(&self, key: &str) {
        self.inner.rate_limiter.forget(key);
        self.inner.state.lock().requeues.remove(key);
    }

    /// Times a key has been requeued since it was last forgotten
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner
            .state
            .lock()
            .requeues
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Finish processing a key; requeues it if it was added meanwhile. A
    /// no-op for keys no worker holds.
    pub fn done(&self, key: &str) {
        let requeued = {
            let mut state = self.inner.state.lock();
            if !state.processing.remove(key) {
                return;
            }
            if state.dirty.contains(key) && !state.shutting_down {
                state.queue.push_back(key.to_string());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Reject new keys and release every waiting worker
    pub fn shutdown(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for WorkQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::rate_limiter::{default_controller_rate_limiter, MaxOfRateLimiter};

    fn queue() -> WorkQueue {
        WorkQueue::new("test", default_controller_rate_limiter(true))
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let q = queue();
        q.add("ns/a");
        q.add("ns/a");
        q.add("ns/b");
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        assert_eq!(q.get().await.as_deref(), Some("ns/b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let q = queue();
        q.add("ns/a");
        let key = q.get().await.unwrap();

        // Not handed out twice while in flight
        q.add("ns/a");
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));
        q.done("ns/a");
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_done_on_waiting_key_is_noop() {
        let q = queue();
        q.add("ns/a");
        q.done("ns/a");
        q.forget("ns/a");
        assert_eq!(q.len(), 1);

        let key = q.get().await.unwrap();
        assert_eq!(key, "ns/a");
        // Held by the first worker; nobody else may get it
        let second = tokio::time::timeout(Duration::from_millis(50), q.get()).await;
        assert!(second.is_err());

        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_get_waits_for_add() {
        let q = queue();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;
        q.add("ns/a");
        let got = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_deref(), Some("ns/a"));
    }

    #[tokio::test]
    async fn test_shutdown_releases_workers() {
        let q = queue();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let q = q.clone();
                tokio::spawn(async move { q.get().await })
            })
            .collect();
        tokio::task::yield_now().await;

        q.shutdown();
        for waiter in waiters {
            let got = tokio::time::timeout(Duration::from_secs(5), waiter)
                .await
                .unwrap()
                .unwrap();
            assert!(got.is_none());
        }

        q.add("ns/a");
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeue() {
        let q = queue();
        q.add_rate_limited("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 1);
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(q.get().await.as_deref(), Some("ns/a"));

        q.forget("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeues_counted_without_backoff() {
        let q = WorkQueue::new("test", MaxOfRateLimiter::new(vec![]));
        q.add_rate_limited("ns/a");
        q.add_rate_limited("ns/a");
        assert_eq!(q.num_requeues("ns/a"), 2);
    }
}
