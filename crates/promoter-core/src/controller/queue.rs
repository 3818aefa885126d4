//! De-duplicating work queue keyed by object.
//!
//! - a key waiting in the queue is never queued twice
//! - a key is handed to at most one worker at a time
//! - a key added while in flight runs once more after [`WorkQueue::done`]
//! - delayed adds keep only the earliest pending deadline per key

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use promoter_store::ObjectKey;
use tokio::sync::Notify;
use tokio::time::Instant;

pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(300);

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<ObjectKey>,
    queued: HashSet<ObjectKey>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    delayed: HashMap<ObjectKey, Instant>,
    failures: HashMap<ObjectKey, u32>,
    shutdown: bool,
}

#[derive(Debug, Default)]
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Queue `key`. Returns false if the queue is shut down.
    pub fn add(&self, key: ObjectKey) -> bool {
        let mut state = self.lock();
        if state.shutdown {
            return false;
        }
        if state.in_flight.contains(&key) {
            state.dirty.insert(key);
            return true;
        }
        if state.queued.insert(key.clone()) {
            state.ready.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
        true
    }

    /// Queue `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        {
            let mut state = self.lock();
            if state.shutdown {
                return;
            }
            match state.delayed.get(&key) {
                Some(existing) if *existing <= deadline => return,
                _ => {
                    state.delayed.insert(key.clone(), deadline);
                }
            }
        }
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let current = {
                let mut state = queue.lock();
                if state.delayed.get(&key) == Some(&deadline) {
                    state.delayed.remove(&key);
                    true
                } else {
                    false
                }
            };
            // A sooner timer replaced this one and already fired.
            if current {
                queue.add(key);
            }
        });
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn next(&self) -> Option<ObjectKey> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.ready.pop_front() {
                    state.queued.remove(&key);
                    state.in_flight.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark `key` finished. Re-queues it if it was added while in flight.
    pub fn done(&self, key: &ObjectKey) {
        let requeue = {
            let mut state = self.lock();
            state.in_flight.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.add(key.clone());
        }
    }

    /// Record a failure and return how long to wait before retrying:
    /// [`BACKOFF_BASE`] doubled per consecutive failure, capped at
    /// [`BACKOFF_CAP`].
    pub fn backoff(&self, key: &ObjectKey) -> Duration {
        let mut state = self.lock();
        let failures = state.failures.entry(key.clone()).or_insert(0);
        *failures = failures.saturating_add(1);
        let exponent = (*failures - 1).min(16);
        BACKOFF_BASE
            .saturating_mul(1u32 << exponent)
            .min(BACKOFF_CAP)
    }

    /// Clear the failure count of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.lock().failures.remove(key);
    }

    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Keys waiting to be handed out.
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("default", name)
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        queue.add(key("a"));
        queue.add(key("b"));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await, Some(key("a")));
        assert_eq!(queue.next().await, Some(key("b")));
    }

    #[tokio::test]
    async fn test_key_added_in_flight_runs_again_after_done() {
        let queue = WorkQueue::new();
        queue.add(key("a"));
        let first = queue.next().await.unwrap();
        queue.add(key("a"));
        assert!(queue.is_empty(), "in-flight key must not be handed out twice");

        queue.done(&first);
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_backoff_doubles_and_caps() {
        let queue = WorkQueue::new();
        let k = key("a");
        assert_eq!(queue.backoff(&k), Duration::from_secs(1));
        assert_eq!(queue.backoff(&k), Duration::from_secs(2));
        assert_eq!(queue.backoff(&k), Duration::from_secs(4));
        for _ in 0..20 {
            queue.backoff(&k);
        }
        assert_eq!(queue.backoff(&k), BACKOFF_CAP);

        queue.forget(&k);
        assert_eq!(queue.backoff(&k), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_and_keeps_earliest() {
        let queue = WorkQueue::new();
        queue.add_after(key("a"), Duration::from_secs(30));
        queue.add_after(key("a"), Duration::from_secs(5));
        queue.add_after(key("a"), Duration::from_secs(60));
        assert!(queue.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some(key("a")));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue = WorkQueue::new();
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;
        queue.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
        assert!(!queue.add(key("a")));
    }
}
