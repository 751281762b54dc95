//! Requeue Rate Limiters
//!
//! Decide how long a failed key waits before it is handed to a worker again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Base delay of the per-item exponential backoff
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(15);
/// Cap of the per-item exponential backoff
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(1000);
/// Sustained requeues per second across all keys
pub const DEFAULT_BUCKET_QPS: f64 = 10.0;
/// Requeues allowed in a burst across all keys
pub const DEFAULT_BUCKET_BURST: u32 = 100;

/// Computes requeue delays and tracks per-key failures
pub trait RateLimiter: Send + Sync {
    /// Delay before `item` may be processed again; counts as one failure
    fn when(&self, item: &str) -> Duration;

    /// Stop tracking `item`
    fn forget(&self, item: &str);

    /// Failures recorded for `item` since it was last forgotten
    fn num_requeues(&self, item: &str) -> u32;
}

// =============================================================================
// Per-Item Exponential Backoff
// =============================================================================

/// `base * 2^failures`, capped at `max`
pub struct ItemExponentialFailureRateLimiter {
    base_delay: Duration,
    max_delay: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialFailureRateLimiter {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialFailureRateLimiter {
    fn when(&self, item: &str) -> Duration {
        let exp = {
            let mut failures = self.failures.lock();
            let count = failures.entry(item.to_string()).or_insert(0);
            let exp = *count;
            *count = count.saturating_add(1);
            exp
        };

        let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    fn forget(&self, item: &str) {
        self.failures.lock().remove(item);
    }

    fn num_requeues(&self, item: &str) -> u32 {
        self.failures.lock().get(item).copied().unwrap_or(0)
    }
}

// =============================================================================
// Global Token Bucket
// =============================================================================

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Shared token bucket; spaces requeues of all keys together
pub struct BucketRateLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketRateLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        Self {
            qps,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketRateLimiter {
    fn when(&self, _item: &str) -> Duration {
        let mut bucket = self.bucket.lock();
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;

        // A negative balance is a reservation against future refills
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }

    fn forget(&self, _item: &str) {}

    fn num_requeues(&self, _item: &str) -> u32 {
        0
    }
}

// =============================================================================
// Max Of
// =============================================================================

/// Longest delay of all wrapped limiters
pub struct MaxOfRateLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfRateLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfRateLimiter {
    fn when(&self, item: &str) -> Duration {
        self.limiters
            .iter()
            .map(|limiter| limiter.when(item))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, item: &str) {
        for limiter in &self.limiters {
            limiter.forget(item);
        }
    }

    fn num_requeues(&self, item: &str) -> u32 {
        self.limiters
            .iter()
            .map(|limiter| limiter.num_requeues(item))
            .max()
            .unwrap_or(0)
    }
}

/// Limiter used by the controller queues
pub fn default_controller_rate_limiter(exponential_backoff: bool) -> MaxOfRateLimiter {
    let mut limiters: Vec<Box<dyn RateLimiter>> = Vec::with_capacity(2);
    if exponential_backoff {
        limiters.push(Box::new(ItemExponentialFailureRateLimiter::new(
            DEFAULT_BASE_DELAY,
            DEFAULT_MAX_DELAY,
        )));
    }
    limiters.push(Box::new(BucketRateLimiter::new(
        DEFAULT_BUCKET_QPS,
        DEFAULT_BUCKET_BURST,
    )));
    MaxOfRateLimiter::new(limiters)
}
