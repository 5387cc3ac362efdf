//! Token-bucket rate limiting and bucket stores.

mod backend;
mod bucket;
mod distributed;
mod identifier;
mod limiter;
mod memory;

pub use backend::{BucketSnapshot, RateLimiterBackend};
pub use bucket::{BucketConfig, BucketState, Decision};
pub use distributed::{RedisBackend, RedisSettings, DEFAULT_KEY_PREFIX};
pub use identifier::{Identifier, KeyScope, RequestContext, UNRESOLVED};
pub use limiter::{
    RateLimitHeaders, RateLimitOutcome, RateLimiter, Rejection, RejectionBody, HEADER_LIMIT,
    HEADER_REMAINING, HEADER_RESET, HEADER_TYPE, RATE_LIMIT_TYPE,
};
pub use memory::{EvictionPolicy, MemoryBackend};
