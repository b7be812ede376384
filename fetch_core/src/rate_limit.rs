//! Bandwidth ceilings: the limiter descriptor and the token bucket that enforces it.

use std::time::{Duration, Instant};

/// Burst allowance for every limited direction: two 16 KiB protocol blocks.
pub const BURST_BYTES: u32 = 32 << 10;

/// A throughput ceiling in bytes, or no ceiling at all.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RateLimiterSpec {
    Unlimited,
    Limited {
        /// Sustained rate in bytes per second.
        bytes_per_second: f64,
        /// Bucket capacity in bytes.
        burst: u32,
    },
}

impl RateLimiterSpec {
    /// Converts a ceiling in megabits per second into a byte-rate limiter.
    ///
    /// Absent, zero, negative and NaN inputs mean "unlimited".
    pub fn from_megabits(ceiling: Option<f64>) -> Self {
        match ceiling {
            Some(mbps) if mbps > 0.0 => Self::Limited {
                bytes_per_second: mbps * 1_000_000.0 / 8.0,
                burst: BURST_BYTES,
            },
            _ => Self::Unlimited,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }
}

/// A token bucket rate limiter.
///
/// Tokens are bytes. The bucket may go into debt so that a request larger
/// than the burst is paced rather than refused forever.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64, // tokens per second
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of tokens the bucket can hold.
    /// * `refill_rate` - Tokens added per second.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Builds the bucket for a limited spec; `None` when unlimited.
    pub fn from_spec(spec: &RateLimiterSpec) -> Option<Self> {
        match *spec {
            RateLimiterSpec::Unlimited => None,
            RateLimiterSpec::Limited {
                bytes_per_second,
                burst,
            } => Some(Self::new(f64::from(burst), bytes_per_second)),
        }
    }

    /// Debits `amount` tokens and returns how long the caller must wait
    /// before acting on them. Zero when the bucket covered the request.
    pub fn reserve(&mut self, amount: f64) -> Duration {
        self.reserve_at(amount, Instant::now())
    }

    fn reserve_at(&mut self, amount: f64, now: Instant) -> Duration {
        self.refill(now);
        self.tokens -= amount;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-self.tokens / self.refill_rate).unwrap_or(Duration::MAX)
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        let new_tokens = elapsed * self.refill_rate;

        if new_tokens > 0.0 {
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_refill = now;
        }
    }
}
