use std::collections::HashMap;

use parking_lot::Mutex;

use crate::types::UnixMillis;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    window_start: UnixMillis,
    count: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    max_requests: u32,
    window_ms: i64,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window_ms: i64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            max_requests,
            window_ms,
        }
    }

    /// Counts one request for `key`; false once the window's quota is spent.
    pub fn check(&self, key: &str, now: UnixMillis) -> bool {
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_insert(Bucket {
            window_start: now,
            count: 0,
        });

        if now - bucket.window_start >= self.window_ms {
            *bucket = Bucket {
                window_start: now,
                count: 0,
            };
        }

        if bucket.count >= self.max_requests {
            return false;
        }
        bucket.count += 1;
        true
    }

    pub fn purge_idle(&self, now: UnixMillis) {
        let window = self.window_ms;
        self.buckets
            .lock()
            .retain(|_, b| now - b.window_start < window);
    }
}
