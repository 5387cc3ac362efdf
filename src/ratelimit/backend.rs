//! Bucket store trait for abstracting the memory and Redis implementations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::BackendError;

use super::bucket::{BucketConfig, Decision};
use super::identifier::Identifier;

/// Read-only view of a bucket, refilled up to the time it was taken.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub last_refill_at: DateTime<Utc>,
    pub capacity: u32,
    pub refill_rate_per_second: f64,
}

/// Trait for bucket store implementations.
///
/// This trait abstracts over the in-process `MemoryBackend` and the
/// `RedisBackend` so the limiter can work with either.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Sizing shared by every bucket in this store.
    fn config(&self) -> &BucketConfig;

    /// Atomically refill the identifier's bucket and try to take `cost` tokens.
    async fn allow(&self, identifier: &Identifier, cost: u32) -> Result<Decision, BackendError>;

    /// Drop the identifier's bucket; the next call starts fully charged.
    async fn reset(&self, identifier: &Identifier) -> Result<(), BackendError>;

    /// Current state of the identifier's bucket, without consuming tokens.
    async fn inspect(&self, identifier: &Identifier) -> Result<BucketSnapshot, BackendError>;

    /// Stop any background work owned by the store.
    async fn shutdown(&self) {}
}
