//! The limiter façade used on the request path.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::{BackendKind, TokengateConfig};
use crate::error::Result;

use super::backend::{BucketSnapshot, RateLimiterBackend};
use super::bucket::{BucketConfig, Decision};
use super::distributed::RedisBackend;
use super::identifier::{Identifier, KeyScope, RequestContext, UNRESOLVED};
use super::memory::MemoryBackend;

/// Bound on the Redis reachability check made at startup.
const STARTUP_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Value of the `X-RateLimit-Type` header.
pub const RATE_LIMIT_TYPE: &str = "token-bucket";

pub const HEADER_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_TYPE: &str = "X-RateLimit-Type";

/// Informational headers attached to every limited call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitHeaders {
    /// Bucket capacity
    pub limit: u32,
    /// Whole tokens left after this call
    pub remaining: u64,
    /// Unix timestamp at which the requested cost becomes available
    pub reset: i64,
}

impl RateLimitHeaders {
    fn from_decision(config: &BucketConfig, decision: &Decision) -> Self {
        let reset = chrono::Duration::from_std(decision.wait)
            .ok()
            .and_then(|wait| Utc::now().checked_add_signed(wait))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            limit: config.capacity(),
            remaining: decision.remaining.max(0.0).floor() as u64,
            reset: reset.timestamp(),
        }
    }

    /// Header name/value pairs in a stable order.
    pub fn to_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            (HEADER_LIMIT, self.limit.to_string()),
            (HEADER_REMAINING, self.remaining.to_string()),
            (HEADER_RESET, self.reset.to_string()),
            (HEADER_TYPE, RATE_LIMIT_TYPE.to_string()),
        ]
    }
}

/// JSON body sent with a throttled response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionBody {
    pub error: String,
    pub message: String,
}

/// Why and for how long a call was turned away.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub retry_after: Duration,
    pub body: RejectionBody,
}

impl Rejection {
    /// HTTP status of a throttled response.
    pub const STATUS: u16 = 429;

    fn new(retry_after: Duration) -> Self {
        Self {
            retry_after,
            body: RejectionBody {
                error: "rate_limit_exceeded".to_string(),
                message: format!(
                    "Rate limit exceeded. Try again in {:.2} seconds.",
                    retry_after.as_secs_f64()
                ),
            },
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.body)
    }
}

/// Everything the request pipeline needs to admit or reject a call.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitOutcome {
    pub identifier: Identifier,
    pub decision: Decision,
    /// Absent when limiting is disabled
    pub headers: Option<RateLimitHeaders>,
    /// Present only when the call must be rejected
    pub rejection: Option<Rejection>,
}

impl RateLimitOutcome {
    pub fn is_allowed(&self) -> bool {
        self.rejection.is_none()
    }
}

/// Front door to a bucket store.
///
/// Backend failures never reach the caller: `allow` and `check` fail open
/// and report a full bucket. Only the administrative `reset` and `inspect`
/// return errors.
pub struct RateLimiter {
    backend: Arc<dyn RateLimiterBackend>,
    scope: KeyScope,
    enabled: bool,
}

impl RateLimiter {
    /// Create an enabled limiter with one budget per caller.
    pub fn new(backend: Arc<dyn RateLimiterBackend>) -> Self {
        Self {
            backend,
            scope: KeyScope::PerCaller,
            enabled: true,
        }
    }

    /// Build the limiter and store described by the service configuration.
    ///
    /// An unreachable Redis is logged but does not fail startup; calls are
    /// admitted until it recovers.
    pub async fn from_config(config: &TokengateConfig) -> Result<Self> {
        let settings = &config.rate_limiting;
        let bucket = settings.bucket_config()?;

        let backend: Arc<dyn RateLimiterBackend> = match config.resolved_backend() {
            BackendKind::Redis => {
                let backend = RedisBackend::new(bucket, settings.redis_settings())?;
                if let Err(err) = backend.ping(STARTUP_PING_TIMEOUT).await {
                    warn!(
                        url = %settings.redis.url,
                        error = %err,
                        "Redis is not reachable, requests will be allowed until it recovers"
                    );
                }
                Arc::new(backend)
            }
            BackendKind::Memory | BackendKind::Auto => {
                Arc::new(MemoryBackend::new(bucket, settings.eviction_policy()))
            }
        };

        info!(
            backend = backend.name(),
            enabled = settings.enabled,
            per_route = settings.per_route,
            requests_per_minute = settings.requests_per_minute,
            "Rate limiter initialized"
        );

        Ok(Self::new(backend)
            .with_scope(settings.key_scope())
            .with_enabled(settings.enabled))
    }

    pub fn with_scope(mut self, scope: KeyScope) -> Self {
        self.scope = scope;
        self
    }

    /// A disabled limiter admits everything without touching its store.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn config(&self) -> &BucketConfig {
        self.backend.config()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Try to take `cost` tokens from the identifier's bucket.
    pub async fn allow(&self, identifier: &Identifier, cost: u32) -> Decision {
        let identifier = effective(identifier);

        match self.backend.allow(&identifier, cost).await {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    identifier = %identifier,
                    backend = self.backend.name(),
                    error = %err,
                    "Rate limit backend failed, allowing request"
                );
                Decision::allowed(self.config().capacity() as f64)
            }
        }
    }

    /// [`allow`](Self::allow) with the configured per-request cost.
    pub async fn allow_default(&self, identifier: &Identifier) -> Decision {
        self.allow(identifier, self.config().tokens_per_request()).await
    }

    /// Decide on an inbound call using the configured per-request cost.
    pub async fn check(&self, ctx: &RequestContext) -> RateLimitOutcome {
        self.check_with_cost(ctx, None).await
    }

    /// Decide on an inbound call, optionally overriding its cost.
    pub async fn check_with_cost(
        &self,
        ctx: &RequestContext,
        cost: Option<u32>,
    ) -> RateLimitOutcome {
        let identifier = Identifier::resolve(ctx, self.scope);

        if !self.enabled {
            return RateLimitOutcome {
                identifier,
                decision: Decision::allowed(self.config().capacity() as f64),
                headers: None,
                rejection: None,
            };
        }

        let cost = cost.unwrap_or_else(|| self.config().tokens_per_request());
        let decision = self.allow(&identifier, cost).await;
        let headers = RateLimitHeaders::from_decision(self.config(), &decision);

        let rejection = if decision.allowed {
            trace!(identifier = %identifier, remaining = decision.remaining, "Request admitted");
            None
        } else {
            debug!(
                identifier = %identifier,
                wait = ?decision.wait,
                "Rate limit exceeded"
            );
            Some(Rejection::new(decision.wait))
        };

        RateLimitOutcome {
            identifier,
            decision,
            headers: Some(headers),
            rejection,
        }
    }

    /// Clear the identifier's bucket.
    pub async fn reset(&self, identifier: &Identifier) -> Result<()> {
        let identifier = effective(identifier);
        self.backend.reset(&identifier).await?;
        Ok(())
    }

    /// Read the identifier's bucket without consuming tokens.
    pub async fn inspect(&self, identifier: &Identifier) -> Result<BucketSnapshot> {
        let identifier = effective(identifier);
        Ok(self.backend.inspect(&identifier).await?)
    }

    /// Stop background work owned by the backend.
    pub async fn shutdown(&self) {
        self.backend.shutdown().await;
    }
}

/// Substitute a dedicated bucket for an empty identifier instead of failing.
fn effective(identifier: &Identifier) -> Cow<'_, Identifier> {
    if identifier.is_empty() {
        warn!("Empty rate limit identifier, using the unresolved bucket");
        Cow::Owned(Identifier::new(UNRESOLVED))
    } else {
        Cow::Borrowed(identifier)
    }
}
