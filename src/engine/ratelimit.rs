//! Fixed-window rate limiter
//!
//! One counter bucket per caller-chosen key. Independent of replication
//! semantics; guards push/pull traffic ahead of the engine.

use std::collections::HashMap;
use std::sync::Mutex;

struct Bucket {
    window_start_ms: u64,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CheckResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
pub struct Stats {
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: u64,
}

#[derive(Default)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check_and_record(
        &self,
        key: &str,
        window_ms: u64,
        max_requests: u32,
        now_ms: u64,
    ) -> CheckResult {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            window_start_ms: now_ms,
            count: 0,
        });

        if now_ms.saturating_sub(bucket.window_start_ms) >= window_ms {
            bucket.window_start_ms = now_ms;
            bucket.count = 0;
        }

        bucket.count += 1;
        let allowed = bucket.count <= max_requests;
        let remaining = max_requests.saturating_sub(bucket.count);
        let retry_after_ms = if allowed {
            None
        } else {
            Some((bucket.window_start_ms + window_ms).saturating_sub(now_ms))
        };

        CheckResult {
            allowed,
            remaining,
            retry_after_ms,
        }
    }

    pub fn get_stats(&self, key: &str, window_ms: u64, max_requests: u32, now_ms: u64) -> Stats {
        let buckets = self.buckets.lock().unwrap();
        match buckets.get(key) {
            Some(bucket) if now_ms.saturating_sub(bucket.window_start_ms) < window_ms => Stats {
                limit: max_requests,
                remaining: max_requests.saturating_sub(bucket.count),
                reset_ms: (bucket.window_start_ms + window_ms).saturating_sub(now_ms),
            },
            _ => Stats {
                limit: max_requests,
                remaining: max_requests,
                reset_ms: window_ms,
            },
        }
    }

    /// Purge buckets whose window ended more than `stale_after_ms` ago.
    /// Bounded per cron tick by the caller looping `batch_size` at a time.
    pub fn cleanup(&self, now_ms: u64, stale_after_ms: u64, batch_size: usize) -> usize {
        let mut buckets = self.buckets.lock().unwrap();
        let stale: Vec<String> = buckets
            .iter()
            .filter(|(_, b)| now_ms.saturating_sub(b.window_start_ms) > stale_after_ms)
            .take(batch_size)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            buckets.remove(key);
        }
        stale.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_max_then_denies() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            let r = limiter.check_and_record("k", 1000, 5, 0);
            assert!(r.allowed);
        }
        let denied = limiter.check_and_record("k", 1000, 5, 0);
        assert!(!denied.allowed);
        assert!(denied.retry_after_ms.is_some());
    }

    #[test]
    fn window_resets_after_elapsed_time() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.check_and_record("k", 1000, 5, 0);
        }
        let r = limiter.check_and_record("k", 1000, 5, 1000);
        assert!(r.allowed);
    }

    #[test]
    fn stats_are_read_only() {
        let limiter = RateLimiter::new();
        limiter.check_and_record("k", 1000, 5, 0);
        let before = limiter.get_stats("k", 1000, 5, 0);
        let after = limiter.get_stats("k", 1000, 5, 0);
        assert_eq!(before.remaining, after.remaining);
    }

    #[test]
    fn cleanup_purges_only_stale_buckets() {
        let limiter = RateLimiter::new();
        limiter.check_and_record("old", 1000, 5, 0);
        limiter.check_and_record("fresh", 1000, 5, 100_000);
        let purged = limiter.cleanup(100_000, 48 * 3600 * 1000, 500);
        assert_eq!(purged, 0); // not stale yet at this timescale
    }
}
