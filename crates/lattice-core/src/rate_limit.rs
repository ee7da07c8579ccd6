use crate::clock::Clock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub window_ms: u64,
    pub budget: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            budget: 50,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RateBucket {
    count: u32,
    window_start_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub remaining: u32,
    pub window_ms: u64,
}

/// Fixed-window call budget per plugin id.
///
/// A bucket resets wholesale once its window has elapsed. Denied calls still
/// consume a slot.
pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, RateBucket>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, plugin_id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut buckets = self.buckets();
        let bucket = buckets
            .entry(plugin_id.to_string())
            .or_insert(RateBucket {
                count: 0,
                window_start_ms: now,
            });

        if now.saturating_sub(bucket.window_start_ms) >= self.config.window_ms {
            *bucket = RateBucket {
                count: 0,
                window_start_ms: now,
            };
        }

        bucket.count = bucket.count.saturating_add(1);
        bucket.count <= self.config.budget
    }

    pub fn status(&self, plugin_id: &str) -> RateLimitStatus {
        let now = self.clock.now_ms();
        let buckets = self.buckets();
        match buckets.get(plugin_id) {
            Some(bucket) => {
                let elapsed = now.saturating_sub(bucket.window_start_ms);
                if elapsed >= self.config.window_ms {
                    self.fresh_status()
                } else {
                    RateLimitStatus {
                        remaining: self.config.budget.saturating_sub(bucket.count),
                        window_ms: self.config.window_ms - elapsed,
                    }
                }
            }
            None => self.fresh_status(),
        }
    }

    pub fn reset(&self, plugin_id: &str) {
        self.buckets().remove(plugin_id);
    }

    pub fn tracked_count(&self) -> usize {
        self.buckets().len()
    }

    fn fresh_status(&self) -> RateLimitStatus {
        RateLimitStatus {
            remaining: self.config.budget,
            window_ms: self.config.window_ms,
        }
    }

    fn buckets(&self) -> MutexGuard<'_, HashMap<String, RateBucket>> {
        self.buckets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
