//! Deduplicating FIFO of object keys with rate-limited delayed re-entry.
//!
//! The queue is the sole mailbox between the informer, the workers and the
//! retry logic: notifications enqueue keys, workers [`get`](WorkQueue::get)
//! them, and failed processings come back through
//! [`add_rate_limited`](WorkQueue::add_rate_limited). A key is never queued
//! twice, and a key re-added while a worker holds it becomes eligible again
//! only once [`done`](WorkQueue::done) releases it.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Weak};

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

use crate::rate_limit::RequeueRateLimiter;
use crate::resource::ObjectKey;

/// Thread-safe deduplicating work queue.
///
/// Construction hands out an [`Arc`]:
/// [`add_rate_limited`](Self::add_rate_limited) keeps a handle to itself to
/// schedule the delayed re-entry.
pub struct WorkQueue {
    inner: Mutex<Inner>,
    wakeup: Notify,
    limiter: RequeueRateLimiter,
    self_ref: Weak<WorkQueue>,
}

struct Inner {
    // FIFO of keys eligible for delivery. `queued_at` doubles as the
    // membership set: a key is "dirty" exactly while it has an entry there.
    order: VecDeque<ObjectKey>,
    queued_at: AHashMap<ObjectKey, Instant>,
    processing: HashSet<ObjectKey>,
    shut_down: bool,
}

impl WorkQueue {
    /// Queue with the default rate limiter (per-key exponential backoff of
    /// 5 ms doubling up to 1000 s, global bucket of 10 QPS with burst 100).
    pub fn new() -> Arc<Self> {
        Self::with_rate_limiter(RequeueRateLimiter::default())
    }

    /// Queue with a custom requeue rate limiter.
    pub fn with_rate_limiter(limiter: RequeueRateLimiter) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(Inner {
                order: VecDeque::new(),
                queued_at: AHashMap::new(),
                processing: HashSet::new(),
                shut_down: false,
            }),
            wakeup: Notify::new(),
            limiter,
            self_ref: self_ref.clone(),
        })
    }

    /// Enqueue `key` for processing.
    ///
    /// A key already enqueued, or currently being processed, coalesces into
    /// a single future delivery. Adds after [`shut_down`](Self::shut_down)
    /// are ignored.
    pub fn add(&self, key: ObjectKey) {
        let mut inner = self.inner.lock();
        if inner.shut_down || inner.queued_at.contains_key(&key) {
            return;
        }
        inner.queued_at.insert(key.clone(), Instant::now());
        if inner.processing.contains(&key) {
            // Redelivered by done() once the in-flight processing ends.
            return;
        }
        inner.order.push_back(key);
        drop(inner);
        self.wakeup.notify_one();
    }

    /// Enqueue `key` after its rate-limited backoff.
    pub fn add_rate_limited(&self, key: ObjectKey) {
        let delay = self.limiter.next_delay(&key);
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let Some(queue) = self.self_ref.upgrade() else {
            return;
        };
        trace!(%key, ?delay, "delaying requeue");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key.
    ///
    /// Returns the key and the instant it was enqueued, or `None` once the
    /// queue has been shut down. The key is marked in-flight until
    /// [`done`](Self::done).
    pub async fn get(&self) -> Option<(ObjectKey, Instant)> {
        loop {
            let wakeup = self.wakeup.notified();
            tokio::pin!(wakeup);
            wakeup.as_mut().enable();
            {
                let mut inner = self.inner.lock();
                if let Some(key) = inner.order.pop_front() {
                    let queued_at = inner.queued_at.remove(&key).unwrap_or_else(Instant::now);
                    inner.processing.insert(key.clone());
                    let more = !inner.order.is_empty();
                    drop(inner);
                    if more {
                        // Chain the wakeup for the next waiting worker.
                        self.wakeup.notify_one();
                    }
                    return Some((key, queued_at));
                }
                if inner.shut_down {
                    return None;
                }
            }
            wakeup.await;
        }
    }

    /// Release the in-flight mark on `key`.
    ///
    /// If the key was re-added while it was being processed, it goes back
    /// to the tail of the queue.
    pub fn done(&self, key: &ObjectKey) {
        let mut inner = self.inner.lock();
        inner.processing.remove(key);
        if inner.queued_at.contains_key(key) && !inner.shut_down {
            inner.order.push_back(key.clone());
            drop(inner);
            self.wakeup.notify_one();
        }
    }

    /// Consecutive rate-limited re-adds of `key` since the last
    /// [`forget`](Self::forget).
    pub fn num_requeues(&self, key: &ObjectKey) -> usize {
        self.limiter.retries(key)
    }

    /// Zero the per-key backoff state of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.limiter.forget(key);
    }

    /// Shut the queue down: pending [`get`](Self::get) calls unblock with
    /// the exit signal, queued keys are dropped and further adds are
    /// refused. Idempotent. In-flight processing is unaffected.
    pub fn shut_down(&self) {
        {
            let mut inner = self.inner.lock();
            if inner.shut_down {
                return;
            }
            inner.shut_down = true;
            inner.order.clear();
            inner.queued_at.clear();
        }
        self.wakeup.notify_waiters();
    }

    /// Number of keys currently queued (excluding in-flight keys).
    pub fn len(&self) -> usize {
        self.inner.lock().order.len()
    }

    /// Whether no keys are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
