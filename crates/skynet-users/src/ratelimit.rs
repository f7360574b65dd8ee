//! Per-user token-bucket rate limiter for inbound messages.
//!
//! Default: 20 messages per 60 seconds. Purely in-memory — a restart resets
//! every bucket, which is fine since the limiter exists to absorb bursts,
//! not to enforce a hard daily quota (that's `User::max_tokens_per_day`).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub const DEFAULT_CAPACITY: u32 = 20;
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token-bucket limiter keyed by user id.
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(capacity: u32, window: Duration) -> Self {
        Self {
            capacity,
            window,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn refill_rate(&self) -> f64 {
        self.capacity as f64 / self.window.as_secs_f64()
    }

    /// Try to consume one token for `user_id`. Returns `true` if allowed.
    pub fn check(&self, user_id: &str) -> bool {
        let mut buckets = self.buckets.lock().unwrap();
        let now = Instant::now();
        let rate = self.refill_rate();
        let bucket = buckets.entry(user_id.to_string()).or_insert_with(|| Bucket {
            tokens: self.capacity as f64,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(self.capacity as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, DEFAULT_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_capacity_then_blocks() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("u1"));
        assert!(limiter.check("u1"));
        assert!(limiter.check("u1"));
        assert!(!limiter.check("u1"));
    }

    #[test]
    fn buckets_are_independent_per_user() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("u1"));
        assert!(limiter.check("u2"));
        assert!(!limiter.check("u1"));
    }
}
