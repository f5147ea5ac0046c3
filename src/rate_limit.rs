//! Rate limiting for requeued keys.
//!
//! Two limiters compose into the queue's default policy: a per-key
//! exponential backoff so one failing object retries ever more slowly, and
//! a global token bucket so a storm of failures cannot saturate the
//! workers. The effective delay for a requeue is the larger of the two.

use std::collections::VecDeque;
use std::time::Duration;

use ahash::AHashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::resource::ObjectKey;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(5);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
const DEFAULT_QPS: f64 = 10.0;
const DEFAULT_BURST: f64 = 100.0;

/// Failure-count ceiling before the oldest tracked keys are evicted, so an
/// adversarial key space cannot grow the map without bound.
const MAX_TRACKED_KEYS: usize = 10_000;

/// Per-key exponential backoff: the n-th consecutive requeue of a key is
/// delayed by `min(base * 2^(n-1), cap)`.
pub struct ItemExponentialBackoff {
    base: Duration,
    cap: Duration,
    state: Mutex<FailureState>,
}

struct FailureState {
    failures: AHashMap<ObjectKey, u32>,
    // Insertion order, for eviction once `failures` hits the ceiling.
    // Entries forgotten in the meantime are skipped lazily.
    order: VecDeque<ObjectKey>,
}

impl ItemExponentialBackoff {
    /// Limiter with the given base delay and cap.
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            state: Mutex::new(FailureState {
                failures: AHashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Record a failure for `key` and return the delay before its next
    /// delivery.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut state = self.state.lock();
        if !state.failures.contains_key(key) {
            while state.failures.len() >= MAX_TRACKED_KEYS {
                match state.order.pop_front() {
                    Some(evicted) => {
                        state.failures.remove(&evicted);
                    }
                    None => break,
                }
            }
            state.order.push_back(key.clone());
            // Compact stale order entries left behind by forget().
            if state.order.len() > state.failures.len() * 2 + 16 {
                let FailureState { failures, order } = &mut *state;
                order.retain(|k| failures.contains_key(k));
            }
        }
        let entry = state.failures.entry(key.clone()).or_insert(0);
        let exponent = *entry;
        *entry += 1;
        drop(state);

        let delay = self.base.as_secs_f64() * 2f64.powi(exponent.min(62) as i32);
        if delay > self.cap.as_secs_f64() {
            self.cap
        } else {
            Duration::from_secs_f64(delay)
        }
    }

    /// Consecutive failures recorded for `key` since the last
    /// [`forget`](Self::forget).
    pub fn retries(&self, key: &ObjectKey) -> usize {
        self.state.lock().failures.get(key).copied().unwrap_or(0) as usize
    }

    /// Clear the failure history of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.state.lock().failures.remove(key);
    }
}

impl Default for ItemExponentialBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY)
    }
}

/// Global token bucket over the whole queue.
///
/// Starts full; each requeue takes one token, and once the bucket runs dry
/// requeues are pushed out far enough to respect the refill rate.
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    /// Bucket refilling at `qps` tokens per second with capacity `burst`.
    pub fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refreshed: Instant::now(),
            }),
        }
    }

    /// Take one token, returning how long the caller must wait for it.
    pub fn next_delay(&self) -> Duration {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(state.refreshed).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.refreshed = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.qps)
        }
    }
}

impl Default for TokenBucket {
    fn default() -> Self {
        Self::new(DEFAULT_QPS, DEFAULT_BURST)
    }
}

/// The queue's default requeue policy: per-key exponential backoff combined
/// with a global token bucket, whichever delays longer.
#[derive(Default)]
pub struct RequeueRateLimiter {
    item: ItemExponentialBackoff,
    bucket: TokenBucket,
}

impl RequeueRateLimiter {
    /// Combine an item limiter and a bucket.
    pub fn new(item: ItemExponentialBackoff, bucket: TokenBucket) -> Self {
        Self { item, bucket }
    }

    /// Record a requeue of `key` and return the delay before redelivery.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        self.item.next_delay(key).max(self.bucket.next_delay())
    }

    /// Consecutive requeues of `key` since the last [`forget`](Self::forget).
    pub fn retries(&self, key: &ObjectKey) -> usize {
        self.item.retries(key)
    }

    /// Reset the per-key backoff state of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.item.forget(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> ObjectKey {
        ObjectKey::cluster_scoped(name)
    }

    #[test]
    fn per_key_delay_doubles() {
        let limiter = ItemExponentialBackoff::default();
        let k = key("a");
        assert_eq!(limiter.next_delay(&k), Duration::from_millis(5));
        assert_eq!(limiter.next_delay(&k), Duration::from_millis(10));
        assert_eq!(limiter.next_delay(&k), Duration::from_millis(20));
        assert_eq!(limiter.retries(&k), 3);

        // Independent keys do not share history.
        assert_eq!(limiter.next_delay(&key("b")), Duration::from_millis(5));
    }

    #[test]
    fn per_key_delay_is_capped() {
        let limiter = ItemExponentialBackoff::default();
        let k = key("a");
        let mut last = Duration::ZERO;
        for _ in 0..40 {
            last = limiter.next_delay(&k);
        }
        assert_eq!(last, Duration::from_secs(1000));
    }

    #[test]
    fn forget_resets_the_curve() {
        let limiter = ItemExponentialBackoff::default();
        let k = key("a");
        limiter.next_delay(&k);
        limiter.next_delay(&k);
        limiter.forget(&k);
        assert_eq!(limiter.retries(&k), 0);
        assert_eq!(limiter.next_delay(&k), Duration::from_millis(5));
    }

    #[test]
    fn tracked_keys_are_bounded() {
        let limiter = ItemExponentialBackoff::default();
        for i in 0..(MAX_TRACKED_KEYS + 50) {
            limiter.next_delay(&key(&format!("k-{i}")));
        }
        assert!(limiter.state.lock().failures.len() <= MAX_TRACKED_KEYS);
        // The oldest keys were the ones evicted.
        assert_eq!(limiter.retries(&key("k-0")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_throttles_after_the_burst() {
        let bucket = TokenBucket::new(10.0, 2.0);
        assert_eq!(bucket.next_delay(), Duration::ZERO);
        assert_eq!(bucket.next_delay(), Duration::ZERO);
        let delay = bucket.next_delay();
        assert!(delay > Duration::ZERO && delay <= Duration::from_millis(100));

        // Tokens come back as time passes.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(bucket.next_delay(), Duration::ZERO);
    }

    #[test]
    fn combined_limiter_takes_the_larger_delay() {
        let limiter = RequeueRateLimiter::new(
            ItemExponentialBackoff::new(Duration::from_millis(50), Duration::from_secs(10)),
            TokenBucket::new(1000.0, 1000.0),
        );
        assert_eq!(limiter.next_delay(&key("a")), Duration::from_millis(50));
    }
}
