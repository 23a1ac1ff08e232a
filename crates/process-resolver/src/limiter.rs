use std::{
    hash::Hash,
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Per key token bucket limiter. At most `burst` operations per `period` are
/// allowed for each key, refilling continuously. Only the most recently used
/// keys are tracked, an evicted key starts over with a full bucket.
pub struct Limiter<K: Hash + Eq> {
    buckets: LruCache<K, Bucket>,
    burst: f64,
    period: Duration,
}

impl<K: Hash + Eq> Limiter<K> {
    pub fn new(max_keys: NonZeroUsize, burst: u32, period: Duration) -> Self {
        Self {
            buckets: LruCache::new(max_keys),
            burst: burst as f64,
            period,
        }
    }

    pub fn allow(&mut self, key: K) -> bool {
        self.allow_at(key, Instant::now())
    }

    pub fn allow_at(&mut self, key: K, now: Instant) -> bool {
        if self.burst <= 0.0 {
            return false;
        }
        let burst = self.burst;
        let rate = if self.period.is_zero() {
            f64::INFINITY
        } else {
            burst / self.period.as_secs_f64()
        };
        let bucket = self.buckets.get_or_insert_mut(key, || Bucket {
            tokens: burst,
            last: now,
        });
        let elapsed = now.saturating_duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rate).min(burst);
        bucket.last = now;
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
