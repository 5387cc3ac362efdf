//! Token bucket state and the refill/consume computation.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::{Result, TokengateError};

/// Seconds in a minute, used to turn a per-minute budget into a refill rate.
const SECONDS_PER_MINUTE: f64 = 60.0;

/// Immutable sizing of every bucket owned by one limiter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketConfig {
    /// Maximum number of tokens a bucket can hold (burst size).
    capacity: u32,
    /// Tokens added per second of elapsed time.
    refill_rate_per_second: f64,
    /// Tokens consumed by a call that does not name its own cost.
    tokens_per_request: u32,
}

impl BucketConfig {
    /// Create a bucket configuration.
    ///
    /// Fails if the capacity is zero or the refill rate is not a positive,
    /// finite number.
    pub fn new(
        capacity: u32,
        refill_rate_per_second: f64,
        tokens_per_request: u32,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(TokengateError::Config(
                "bucket capacity must be greater than zero".to_string(),
            ));
        }
        if !refill_rate_per_second.is_finite() || refill_rate_per_second <= 0.0 {
            return Err(TokengateError::Config(format!(
                "refill rate must be a positive number, got {}",
                refill_rate_per_second
            )));
        }

        Ok(Self {
            capacity,
            refill_rate_per_second,
            tokens_per_request,
        })
    }

    /// Derive a configuration from a requests-per-minute target.
    ///
    /// The bucket holds one minute of traffic and refills at `rpm / 60`
    /// tokens per second; every request costs one token.
    pub fn from_requests_per_minute(requests_per_minute: u32) -> Result<Self> {
        Self::new(
            requests_per_minute,
            requests_per_minute as f64 / SECONDS_PER_MINUTE,
            1,
        )
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate_per_second(&self) -> f64 {
        self.refill_rate_per_second
    }

    pub fn tokens_per_request(&self) -> u32 {
        self.tokens_per_request
    }
}

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    /// Whether the call may proceed.
    pub allowed: bool,
    /// Tokens left in the bucket after this call.
    pub remaining: f64,
    /// How long until the requested cost would be available. Zero when allowed.
    pub wait: Duration,
}

impl Decision {
    pub fn allowed(remaining: f64) -> Self {
        Self {
            allowed: true,
            remaining,
            wait: Duration::ZERO,
        }
    }

    pub fn denied(remaining: f64, wait: Duration) -> Self {
        Self {
            allowed: false,
            remaining,
            wait,
        }
    }
}

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    /// Tokens currently held, always within `[0, capacity]`.
    pub tokens: f64,
    /// Wall-clock time of the last refill.
    pub last_refill_at: DateTime<Utc>,
}

impl BucketState {
    /// A fully charged bucket.
    pub fn full(config: &BucketConfig, now: DateTime<Utc>) -> Self {
        Self {
            tokens: config.capacity as f64,
            last_refill_at: now,
        }
    }

    /// Token count after refilling up to `now`, without changing the state.
    pub fn refilled(&self, config: &BucketConfig, now: DateTime<Utc>) -> f64 {
        let elapsed = elapsed_seconds(self.last_refill_at, now);
        let tokens = self.tokens + elapsed * config.refill_rate_per_second;
        tokens.clamp(0.0, config.capacity as f64)
    }

    /// Refill up to `now`, then try to take `cost` tokens.
    ///
    /// The refill timestamp moves forward on denial as well, so tokens
    /// credited here are not credited again on the next call.
    pub fn try_consume(
        &mut self,
        config: &BucketConfig,
        now: DateTime<Utc>,
        cost: u32,
    ) -> Decision {
        self.tokens = self.refilled(config, now);
        if now > self.last_refill_at {
            self.last_refill_at = now;
        }

        let cost = cost as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            return Decision::allowed(self.tokens);
        }

        let deficit = cost - self.tokens;
        Decision::denied(self.tokens, wait_for(deficit, config))
    }
}

/// Time needed to accumulate `deficit` tokens.
pub(crate) fn wait_for(deficit: f64, config: &BucketConfig) -> Duration {
    wait_from_secs(deficit / config.refill_rate_per_second)
}

/// Non-negative wait, saturating at `Duration::MAX` for very slow refill rates.
pub(crate) fn wait_from_secs(seconds: f64) -> Duration {
    if seconds > 0.0 {
        Duration::try_from_secs_f64(seconds).unwrap_or(Duration::MAX)
    } else {
        Duration::ZERO
    }
}

/// Seconds from `from` to `to`, clamped at zero for clocks that step backwards.
fn elapsed_seconds(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from)
        .to_std()
        .map(|elapsed| elapsed.as_secs_f64())
        .unwrap_or(0.0)
}
