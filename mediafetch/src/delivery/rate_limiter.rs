//! Per-recipient send pacing.
//!
//! Token bucket per recipient. Exhaustion never fails a delivery; the
//! pipeline parks the task until [`Acquire::Limited::retry_after`] elapses.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::domain::RecipientId;

/// Configuration for a rate limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Maximum tokens (burst capacity).
    pub capacity: u32,
    /// Time to refill the bucket from empty to full.
    pub refill_period: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_period: Duration::from_secs(60 * 60),
        }
    }
}

impl RateLimiterConfig {
    /// Time for a single token to come back.
    pub fn token_interval(&self) -> Duration {
        self.refill_period / self.capacity.max(1)
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.capacity == 0 {
            return Err(crate::Error::config("rate limit capacity must be at least 1"));
        }
        if self.refill_period.is_zero() {
            return Err(crate::Error::config("rate limit refill period must be positive"));
        }
        Ok(())
    }
}

/// Result of asking for a send slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Acquire {
    /// Token taken; `remaining` whole tokens are left.
    Granted { remaining: u32 },
    /// Bucket empty; the next token arrives after `retry_after`.
    Limited { retry_after: Duration },
}

impl Acquire {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(capacity: u32) -> Self {
        Self {
            tokens: capacity as f64,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, capacity: u32, token_interval: Duration) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        let earned = if token_interval.is_zero() {
            capacity as f64
        } else {
            elapsed.as_secs_f64() / token_interval.as_secs_f64()
        };
        self.tokens = (self.tokens + earned).min(capacity as f64);
        self.last_refill = now;
    }
}

/// Token buckets keyed by recipient.
#[derive(Debug)]
pub struct RateLimiter {
    buckets: DashMap<RecipientId, TokenBucket>,
    config: RateLimiterConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Try to take one send token for `recipient`.
    ///
    /// The bucket entry is locked only for this synchronous call.
    pub fn try_acquire(&self, recipient: &RecipientId) -> Acquire {
        let capacity = self.config.capacity;
        let interval = self.config.token_interval();

        let mut bucket = self
            .buckets
            .entry(recipient.clone())
            .or_insert_with(|| TokenBucket::full(capacity));
        bucket.refill(capacity, interval);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            let remaining = bucket.tokens.floor() as u32;
            trace!(recipient = %recipient, remaining, "Send token granted");
            Acquire::Granted { remaining }
        } else {
            let retry_after = interval.mul_f64(1.0 - bucket.tokens);
            debug!(recipient = %recipient, ?retry_after, "Recipient rate limited");
            Acquire::Limited { retry_after }
        }
    }

    /// Whole tokens currently available for `recipient`.
    pub fn remaining(&self, recipient: &RecipientId) -> u32 {
        match self.buckets.get_mut(recipient) {
            Some(mut bucket) => {
                bucket.refill(self.config.capacity, self.config.token_interval());
                bucket.tokens.floor() as u32
            }
            None => self.config.capacity,
        }
    }

    /// Wait until `recipient` has a whole token, or `None` if one is
    /// available now. Takes nothing from the bucket.
    pub fn retry_after(&self, recipient: &RecipientId) -> Option<Duration> {
        let mut bucket = self.buckets.get_mut(recipient)?;
        let interval = self.config.token_interval();
        bucket.refill(self.config.capacity, interval);
        (bucket.tokens < 1.0).then(|| interval.mul_f64(1.0 - bucket.tokens))
    }

    /// Drop buckets that have refilled completely; they are
    /// indistinguishable from fresh ones.
    pub fn purge_idle(&self) -> usize {
        let capacity = self.config.capacity;
        let interval = self.config.token_interval();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(capacity, interval);
            bucket.tokens < capacity as f64
        });
        before - self.buckets.len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimiterConfig::default())
    }
}
