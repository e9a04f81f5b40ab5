//! Retry delays for failed reconciles.
//!
//! The delay of a failing object is the larger of its own exponential
//! backoff and a controller-wide token bucket, so a burst of failures
//! cannot hammer the API server.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// First per-object retry delay.
pub const BASE_DELAY: Duration = Duration::from_secs(1);
/// Per-object retry ceiling.
pub const MAX_DELAY: Duration = Duration::from_secs(300);
/// Tokens refilled per second.
pub const BUCKET_QPS: f64 = 10.0;
/// Bucket capacity.
pub const BUCKET_BURST: f64 = 100.0;

/// Exponential backoff tracked per object key.
#[derive(Debug)]
pub struct ItemExponentialBackoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure and return the delay before the next attempt.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
        let count = failures.entry(key.to_string()).or_insert(0);
        let exponent = (*count).min(31);
        *count = count.saturating_add(1);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }

    /// Forget the failures of an object after a successful reconcile.
    pub fn reset(&self, key: &str) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Number of objects with recorded failures.
    pub fn tracked(&self) -> usize {
        self.failures.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Controller-wide token bucket.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl TokenBucket {
    pub fn new(qps: f64, burst: f64) -> Self {
        Self {
            qps,
            burst,
            bucket: Mutex::new(Bucket {
                tokens: burst,
                last: Instant::now(),
            }),
        }
    }

    /// Take a token and return how long the caller must wait for it.
    pub fn reserve(&self) -> Duration {
        self.reserve_at(Instant::now())
    }

    pub fn reserve_at(&self, now: Instant) -> Duration {
        let mut bucket = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-bucket.tokens / self.qps)
        }
    }
}

/// Combined retry limiter used by the error policies.
#[derive(Debug)]
pub struct RetryLimiter {
    items: ItemExponentialBackoff,
    bucket: TokenBucket,
}

impl Default for RetryLimiter {
    fn default() -> Self {
        Self {
            items: ItemExponentialBackoff::new(BASE_DELAY, MAX_DELAY),
            bucket: TokenBucket::new(BUCKET_QPS, BUCKET_BURST),
        }
    }
}

impl RetryLimiter {
    pub fn next_delay(&self, key: &str) -> Duration {
        self.items.next_delay(key).max(self.bucket.reserve())
    }

    pub fn reset(&self, key: &str) {
        self.items.reset(key);
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.items.failures(key)
    }

    pub fn tracked(&self) -> usize {
        self.items.tracked()
    }
}
