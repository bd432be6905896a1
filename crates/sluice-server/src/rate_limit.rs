use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::store::TokenId;

/// Source of the current time, replaceable in tests
pub type Clock = Arc<dyn Fn() -> Instant + Send + Sync>;

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token-bucket limiter for tunnel creations, keyed by token id
///
/// With a limit of `L` per minute a bucket holds at most `L` tokens and
/// refills at `L / 60` tokens per second.
pub struct RateLimiter {
    buckets: Mutex<HashMap<TokenId, Bucket>>,
    clock: Clock,
}

impl RateLimiter {
    pub fn new() -> Arc<Self> {
        Self::with_clock(Arc::new(Instant::now))
    }

    pub fn with_clock(clock: Clock) -> Arc<Self> {
        Arc::new(Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        })
    }

    /// Consume one creation for `token_id`; `false` when the bucket is empty
    ///
    /// A limit or token id of zero or less is unlimited.
    pub fn allow(&self, token_id: TokenId, limit_per_minute: i64) -> bool {
        if limit_per_minute <= 0 || token_id <= 0 {
            return true;
        }

        let capacity = limit_per_minute as f64;
        let refill_per_sec = capacity / 60.0;
        let now = (self.clock)();

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(token_id).or_insert(Bucket {
            tokens: capacity,
            last: now,
        });

        match now.checked_duration_since(bucket.last) {
            Some(elapsed) if !elapsed.is_zero() => {
                bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * refill_per_sec).min(capacity);
                bucket.last = now;
            }
            Some(_) => {}
            // Clock went backwards: only move the timestamp
            None => bucket.last = now,
        }

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }
}
