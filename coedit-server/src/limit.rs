//! Per-connection token-bucket rate limiting.
//!
//! Each connection owns its buckets, so no synchronization is needed; the
//! connection task refills and drains them inline. The server's limits are
//! authoritative and independent of any throttling clients do themselves.

#[cfg(test)]
use std::time::Duration;

use tokio::time::Instant;

/// Rates enforced per connection, by event kind.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub joins_per_min: u64,
    pub cursor_updates_per_sec: u64,
    pub operation_batches_per_min: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            joins_per_min: 10,
            cursor_updates_per_sec: 50,
            operation_batches_per_min: 200,
        }
    }
}

/// A token bucket: bursts up to `capacity`, refills continuously.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u64, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_consume(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Seconds until one token will be available, rounded up.
    pub fn retry_after_secs(&mut self) -> u64 {
        self.refill();
        if self.tokens >= 1.0 {
            return 0;
        }
        ((1.0 - self.tokens) / self.refill_per_sec).ceil() as u64
    }
}

/// The buckets a single connection drains.
#[derive(Debug)]
pub struct ConnectionLimits {
    pub joins: TokenBucket,
    pub cursor_updates: TokenBucket,
    pub operations: TokenBucket,
}

impl ConnectionLimits {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            joins: TokenBucket::new(config.joins_per_min, config.joins_per_min as f64 / 60.0),
            cursor_updates: TokenBucket::new(
                config.cursor_updates_per_sec,
                config.cursor_updates_per_sec as f64,
            ),
            operations: TokenBucket::new(
                config.operation_batches_per_min,
                config.operation_batches_per_min as f64 / 60.0,
            ),
        }
    }
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self::new(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn bucket_allows_burst_then_refills() {
        let mut bucket = TokenBucket::new(3, 1.0);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
        assert_eq!(bucket.retry_after_secs(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_never_exceeds_capacity() {
        let mut bucket = TokenBucket::new(2, 100.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }
}
