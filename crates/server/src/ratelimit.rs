//! Token buckets and limiter chains
//!
//! Every visitor carries a set of [`TokenBucket`]s (messages, e-mails, auth
//! failures, attachment bandwidth). Attachment uploads additionally pass
//! through a [`Limiter`] chain combining the bandwidth bucket with one-shot
//! budgets for file size and remaining quota.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Something that can admit or reject `n` units of work
pub trait Limiter: Send + Sync {
    /// Try to consume `n` units, returns true if allowed
    fn allow(&self, n: u64) -> bool;
}

/// Token bucket that starts full and regains `refill` tokens every
/// `interval`
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill: u64,
    interval: Duration,
    inner: Mutex<BucketInner>,
}

#[derive(Debug)]
struct BucketInner {
    tokens: u64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket regaining one token per `interval`
    pub fn new(capacity: u64, interval: Duration) -> Self {
        Self::with_refill(capacity, 1, interval)
    }

    /// Create a full bucket regaining `refill` tokens per `interval`
    pub fn with_refill(capacity: u64, refill: u64, interval: Duration) -> Self {
        Self {
            capacity,
            refill,
            interval,
            inner: Mutex::new(BucketInner {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Try to consume `n` tokens, returns true if allowed
    pub fn allow_n(&self, n: u64) -> bool {
        let mut inner = self.inner.lock();
        self.refill_locked(&mut inner);
        if inner.tokens >= n {
            inner.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Try to consume one token
    pub fn allow(&self) -> bool {
        self.allow_n(1)
    }

    /// Tokens currently available
    pub fn value(&self) -> u64 {
        let mut inner = self.inner.lock();
        self.refill_locked(&mut inner);
        inner.tokens
    }

    /// Refill to capacity (daily stats reset)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.tokens = self.capacity;
        inner.last_refill = Instant::now();
    }

    fn refill_locked(&self, inner: &mut BucketInner) {
        if self.interval.is_zero() {
            return;
        }
        let elapsed = inner.last_refill.elapsed();
        let intervals = (elapsed.as_nanos() / self.interval.as_nanos()) as u64;
        if intervals == 0 {
            return;
        }
        let gained = intervals.saturating_mul(self.refill);
        if inner.tokens.saturating_add(gained) >= self.capacity {
            inner.tokens = self.capacity;
            inner.last_refill = Instant::now();
        } else {
            inner.tokens += gained;
            // Advance by whole intervals only, keeping the fractional remainder
            inner.last_refill += self.interval * intervals as u32;
        }
    }
}

impl Limiter for TokenBucket {
    fn allow(&self, n: u64) -> bool {
        self.allow_n(n)
    }
}

/// One-shot budget that admits until `limit` units have been consumed
#[derive(Debug)]
pub struct FixedLimiter {
    remaining: Mutex<u64>,
}

impl FixedLimiter {
    /// Create a budget of `limit` units
    pub fn new(limit: u64) -> Self {
        Self {
            remaining: Mutex::new(limit),
        }
    }

    /// Units left in the budget
    pub fn remaining(&self) -> u64 {
        *self.remaining.lock()
    }
}

impl Limiter for FixedLimiter {
    fn allow(&self, n: u64) -> bool {
        let mut remaining = self.remaining.lock();
        if *remaining >= n {
            *remaining -= n;
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
    fn test_bucket_allows_up_to_burst() {
        let bucket = TokenBucket::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
        assert!(!bucket.allow());
    }

    #[test]
    fn test_bucket_exact_token_accounting() {
        // N tokens remaining yields exactly N trues then falses
        let bucket = TokenBucket::new(10, Duration::from_secs(3600));
        assert!(bucket.allow_n(7));
        for _ in 0..3 {
            assert!(bucket.allow());
        }
        assert!(!bucket.allow());
    }

    #[test]
    fn test_bucket_refills_over_time() {
        let bucket = TokenBucket::new(2, Duration::from_millis(20));
        assert!(bucket.allow());
        assert!(bucket.allow());
        assert!(!bucket.allow());
        std::thread::sleep(Duration::from_millis(50));
        assert!(bucket.allow());
    }

    #[test]
    fn test_bucket_reset() {
        let bucket = TokenBucket::new(3, Duration::from_secs(3600));
        while bucket.allow() {}
        assert_eq!(bucket.value(), 0);
        bucket.reset();
        assert_eq!(bucket.value(), 3);
    }

    #[test]
    fn test_bandwidth_style_bucket() {
        // Bandwidth buckets consume n bytes at a time
        let bucket = TokenBucket::with_refill(1000, 1000, Duration::from_secs(86400));
        assert!(bucket.allow_n(600));
        assert!(!bucket.allow_n(600));
        assert!(bucket.allow_n(400));
        assert!(!bucket.allow_n(1));
    }

    #[test]
    fn test_fixed_limiter() {
        let limiter = FixedLimiter::new(100);
        assert!(limiter.allow(60));
        assert!(!limiter.allow(60));
        assert!(limiter.allow(40));
        assert_eq!(limiter.remaining(), 0);
        assert!(!limiter.allow(1));
    }
}
