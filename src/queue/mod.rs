//! Work Queues
//!
//! Deduplicating queues of `namespace/name` keys with rate-limited requeue,
//! one for claims and one for volumes.

pub mod rate_limiter;
pub mod work_queue;

pub use rate_limiter::{
    default_controller_rate_limiter, BucketRateLimiter, ItemExponentialFailureRateLimiter,
    MaxOfRateLimiter, RateLimiter,
};
pub use work_queue::WorkQueue;
