//! A token-bucket limiter guarding admission and IQ ingestion against a
//! single abusive source.

use std::{
  collections::HashMap,
  sync::Mutex,
  time::{Duration, Instant},
};

struct Bucket {
  tokens: f64,
  last_refill: Instant,
}

pub struct RateLimiter {
  capacity: f64,
  refill_per_sec: f64,
  buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
  pub fn new(capacity: f64, refill_per_sec: f64) -> RateLimiter {
    RateLimiter { capacity, refill_per_sec, buckets: Mutex::new(HashMap::new()) }
  }

  /// Returns `true` if `key` still has a token to spend, consuming one if so.
  pub fn allow(&self, key: &str) -> bool {
    let mut buckets = self.buckets.lock().expect("rate limiter mutex poisoned");
    let now = Instant::now();
    let bucket = buckets.entry(key.to_owned()).or_insert_with(|| Bucket { tokens: self.capacity, last_refill: now });
    let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
    bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
    bucket.last_refill = now;
    if bucket.tokens >= 1.0 {
      bucket.tokens -= 1.0;
      true
    } else {
      false
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exhausts_then_refills() {
    let limiter = RateLimiter::new(2.0, 1.0);
    assert!(limiter.allow("a"));
    assert!(limiter.allow("a"));
    assert!(!limiter.allow("a"));
  }

  #[test]
  fn buckets_are_independent_per_key() {
    let limiter = RateLimiter::new(1.0, 1.0);
    assert!(limiter.allow("a"));
    assert!(limiter.allow("b"));
  }

  #[test]
  fn refills_over_time() {
    let limiter = RateLimiter::new(1.0, 1000.0);
    assert!(limiter.allow("a"));
    std::thread::sleep(Duration::from_millis(5));
    assert!(limiter.allow("a"));
  }
}
