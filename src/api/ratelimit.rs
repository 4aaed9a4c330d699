//! Per-token token-bucket rate limiting

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by bearer-token subject. Buckets refill continuously
/// at `rate_per_sec` up to `burst`.
pub struct RateLimiter {
    burst: f64,
    rate_per_sec: f64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(burst: u32, rate_per_sec: f64) -> Self {
        Self {
            burst: burst.max(1) as f64,
            rate_per_sec: rate_per_sec.max(0.01),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for the key. `false` means rate limited.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("bucket map poisoned");
        // unrelated housekeeping piggybacks on writes; full buckets are
        // indistinguishable from absent ones
        if buckets.len() > 10_000 {
            buckets.retain(|_, b| b.tokens < self.burst);
        }
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until the key has a whole token again.
    pub fn retry_after_secs(&self, key: &str) -> u64 {
        let buckets = self.buckets.lock().expect("bucket map poisoned");
        match buckets.get(key) {
            Some(bucket) if bucket.tokens < 1.0 => {
                ((1.0 - bucket.tokens) / self.rate_per_sec).ceil() as u64
            }
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_limited() {
        let limiter = RateLimiter::new(3, 1.0);
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));
        assert!(limiter.retry_after_secs("alice") >= 1);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, 1.0);
        assert!(limiter.check("alice"));
        assert!(!limiter.check("alice"));
        assert!(limiter.check("bob"));
    }
}
