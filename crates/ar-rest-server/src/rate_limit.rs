// Copyright 2026 Agent Relay Contributors
// SPDX-License-Identifier: AGPL-3.0-only

//! Per-client token-bucket rate limiting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Buckets idle this long are pruned.
const STALE_AFTER: Duration = Duration::from_secs(300);

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// One token bucket per client. Refill is linear at `rpm/60` tokens
/// per second; capacity clamps at `burst + rpm/60` (one second of
/// headroom above burst).
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    default_rpm: u32,
    burst: u32,
}

impl RateLimiter {
    pub fn new(default_rpm: u32, burst: u32) -> Self {
        Self { buckets: Mutex::new(HashMap::new()), default_rpm, burst }
    }

    /// Admit or reject one request. On rejection returns the
    /// retry-after hint in seconds: `ceil(60/rpm)`.
    pub fn check(&self, client_name: &str, rpm_override: Option<u32>) -> Result<(), u64> {
        let rpm = rpm_override.unwrap_or(self.default_rpm).max(1);
        let rate = f64::from(rpm) / 60.0;
        let capacity = f64::from(self.burst) + rate;

        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        let bucket = buckets
            .entry(client_name.to_string())
            .or_insert_with(|| Bucket { tokens: capacity, last_refill: now });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(capacity);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            Err((60.0 / f64::from(rpm)).ceil() as u64)
        }
    }

    /// Drop buckets idle past the staleness window.
    pub fn prune_stale(&self) {
        let mut buckets = self.buckets.lock().expect("rate limiter poisoned");
        let now = Instant::now();
        buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < STALE_AFTER);
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.buckets.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_reject_with_retry_hint() {
        let limiter = RateLimiter::new(60, 3);
        // capacity = 3 + 1 = 4 admissions immediately
        for _ in 0..4 {
            assert!(limiter.check("alice", None).is_ok());
        }
        let retry = limiter.check("alice", None).unwrap_err();
        assert_eq!(retry, 1); // ceil(60/60)
    }

    #[test]
    fn retry_hint_scales_with_rpm() {
        let limiter = RateLimiter::new(60, 0);
        // rpm override 6 → capacity 0 + 0.1, first request already rejected
        let retry = limiter.check("alice", Some(6)).unwrap_err();
        assert_eq!(retry, 10); // ceil(60/6)
    }

    #[test]
    fn token_override_takes_precedence() {
        let limiter = RateLimiter::new(600, 100);
        // Override to a tiny budget: capacity 0 + 1/60.
        assert!(limiter.check("alice", Some(1)).is_err());
        // The same client at default settings would have been admitted,
        // but the bucket was created with override capacity.
        let other = limiter.check("bob", None);
        assert!(other.is_ok());
    }

    #[test]
    fn buckets_are_per_client() {
        let limiter = RateLimiter::new(60, 0);
        assert!(limiter.check("alice", None).is_ok());
        assert!(limiter.check("alice", None).is_err());
        assert!(limiter.check("bob", None).is_ok());
    }

    #[test]
    fn refill_restores_admission() {
        let limiter = RateLimiter::new(6000, 0);
        // rate = 100/s, capacity = 100
        for _ in 0..100 {
            assert!(limiter.check("alice", None).is_ok());
        }
        assert!(limiter.check("alice", None).is_err());
        std::thread::sleep(Duration::from_millis(50));
        // ~5 tokens refilled
        assert!(limiter.check("alice", None).is_ok());
    }

    #[test]
    fn prune_drops_only_stale_buckets() {
        let limiter = RateLimiter::new(60, 1);
        limiter.check("alice", None).unwrap();
        assert_eq!(limiter.bucket_count(), 1);
        limiter.prune_stale();
        // Fresh bucket survives.
        assert_eq!(limiter.bucket_count(), 1);
    }
}
