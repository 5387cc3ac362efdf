//! Redis-backed bucket store shared by every service instance.
//!
//! Each bucket is a hash holding `tokens` and `last_refill`. The whole
//! refill-and-consume step runs as one Lua script on the Redis server, so
//! concurrent callers on different instances can never spend the same
//! token twice.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use redis::aio::MultiplexedConnection;
use tracing::{debug, info, trace};

use crate::error::BackendError;

use super::backend::{BucketSnapshot, RateLimiterBackend};
use super::bucket::{wait_from_secs, BucketConfig, BucketState, Decision};
use super::identifier::Identifier;

/// Default namespace for bucket keys.
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit:bucket";
/// Default lifetime of an untouched bucket record.
const DEFAULT_TTL: Duration = Duration::from_secs(5 * 60);
/// Default bound on a single Redis round trip.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_millis(500);

/// Error code the script replies with when a stored record is corrupt.
const MALFORMED_CODE: &str = "MALFORMED";

/// Refill, consume and persist in one server-side step.
///
/// Numbers are returned as strings: Redis truncates Lua numbers to
/// integers when converting a script reply.
const ALLOW_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local cost = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_refill')
local tokens = capacity
local last_refill = now
if state[1] or state[2] then
    tokens = tonumber(state[1])
    last_refill = tonumber(state[2])
    if tokens == nil or last_refill == nil then
        return redis.error_reply('MALFORMED bucket state at ' .. key)
    end
end

if now < last_refill then
    now = last_refill
end

tokens = math.min(capacity, tokens + (now - last_refill) * refill_rate)
if tokens < 0 then
    tokens = 0
end

local allowed = 0
local wait = 0
if tokens >= cost then
    tokens = tokens - cost
    allowed = 1
else
    wait = (cost - tokens) / refill_rate
end

redis.call('HSET', key, 'tokens', tostring(tokens), 'last_refill', tostring(now))
redis.call('PEXPIRE', key, ttl_ms)

return {allowed, tostring(tokens), tostring(wait)}
"#;

/// Connection settings for the Redis store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedisSettings {
    /// Redis connection URL
    pub url: String,
    /// Namespace prepended to every bucket key
    pub key_prefix: String,
    /// Expiry refreshed on every update of a bucket
    pub ttl: Duration,
    /// Upper bound on one round trip, including connecting
    pub command_timeout: Duration,
}

impl RedisSettings {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            ttl: DEFAULT_TTL,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

/// Token buckets stored in Redis.
pub struct RedisBackend {
    config: BucketConfig,
    client: redis::Client,
    script: redis::Script,
    key_prefix: String,
    ttl: Duration,
    command_timeout: Duration,
    /// Opened on first use and dropped after a transport failure.
    connection: RwLock<Option<MultiplexedConnection>>,
}

impl RedisBackend {
    /// Create the store. No connection is made until the first command.
    pub fn new(config: BucketConfig, settings: RedisSettings) -> Result<Self, BackendError> {
        let client = redis::Client::open(settings.url.as_str())?;

        info!(
            capacity = config.capacity(),
            refill_rate = config.refill_rate_per_second(),
            key_prefix = %settings.key_prefix,
            ttl = ?settings.ttl,
            "Redis bucket store configured"
        );

        Ok(Self {
            config,
            client,
            script: redis::Script::new(ALLOW_SCRIPT),
            key_prefix: settings.key_prefix,
            ttl: settings.ttl,
            command_timeout: settings.command_timeout,
            connection: RwLock::new(None),
        })
    }

    /// Redis key of an identifier's bucket.
    pub fn key_for(&self, identifier: &Identifier) -> String {
        format!("{}:{}", self.key_prefix, identifier)
    }

    /// Check that the store answers within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> Result<(), BackendError> {
        let reply = self
            .bounded(timeout, async {
                let mut conn = self.connection().await?;
                let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok::<_, BackendError>(reply)
            })
            .await?;
        debug!(reply = %reply, "Redis ping");
        Ok(())
    }

    async fn connection(&self) -> Result<MultiplexedConnection, BackendError> {
        let cached = self.connection.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.connection.write() = Some(conn.clone());
        debug!("Opened Redis connection");
        Ok(conn)
    }

    /// Run `op` under a deadline, forgetting the cached connection if the
    /// store looks unreachable.
    async fn bounded<T, F>(&self, timeout: Duration, op: F) -> Result<T, BackendError>
    where
        F: Future<Output = Result<T, BackendError>>,
    {
        let result = match tokio::time::timeout(timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };

        if matches!(result, Err(BackendError::Unavailable(_)) | Err(BackendError::Timeout(_))) {
            self.connection.write().take();
        }
        result
    }

    async fn run_allow(&self, key: &str, cost: u32) -> Result<Decision, BackendError> {
        let mut conn = self.connection().await?;
        let now = unix_seconds(Utc::now());

        let reply: Result<(i64, String, String), redis::RedisError> = self
            .script
            .key(key)
            .arg(self.config.capacity())
            .arg(self.config.refill_rate_per_second())
            .arg(cost)
            .arg(now)
            .arg(self.ttl.as_millis() as u64)
            .invoke_async(&mut conn)
            .await;

        let (allowed, tokens, wait) = match reply {
            Ok(reply) => reply,
            Err(err) if err.code() == Some(MALFORMED_CODE) => {
                return Err(BackendError::MalformedState(format!("{}: {}", key, err)));
            }
            Err(err) => return Err(err.into()),
        };

        let remaining = parse_number(&tokens, "tokens")?;
        let wait = parse_number(&wait, "wait")?;

        Ok(Decision {
            allowed: allowed == 1,
            remaining,
            wait: wait_from_secs(wait),
        })
    }

    async fn run_inspect(&self, key: &str) -> Result<BucketSnapshot, BackendError> {
        let mut conn = self.connection().await?;
        let (tokens, last_refill): (Option<String>, Option<String>) = redis::cmd("HMGET")
            .arg(key)
            .arg("tokens")
            .arg("last_refill")
            .query_async(&mut conn)
            .await?;

        let now = Utc::now();
        let state = match (tokens, last_refill) {
            (None, None) => BucketState::full(&self.config, now),
            (Some(tokens), Some(last_refill)) => BucketState {
                tokens: parse_number(&tokens, "tokens")?,
                last_refill_at: from_unix_seconds(parse_number(&last_refill, "last_refill")?)?,
            },
            _ => {
                return Err(BackendError::MalformedState(format!(
                    "{}: partial bucket record",
                    key
                )))
            }
        };

        Ok(BucketSnapshot {
            tokens: state.refilled(&self.config, now),
            last_refill_at: state.last_refill_at,
            capacity: self.config.capacity(),
            refill_rate_per_second: self.config.refill_rate_per_second(),
        })
    }
}

#[async_trait]
impl RateLimiterBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn config(&self) -> &BucketConfig {
        &self.config
    }

    async fn allow(&self, identifier: &Identifier, cost: u32) -> Result<Decision, BackendError> {
        let key = self.key_for(identifier);
        let decision = self
            .bounded(self.command_timeout, self.run_allow(&key, cost))
            .await?;

        trace!(
            key = %key,
            cost = cost,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Redis bucket checked"
        );

        Ok(decision)
    }

    async fn reset(&self, identifier: &Identifier) -> Result<(), BackendError> {
        let key = self.key_for(identifier);
        let removed = self
            .bounded(self.command_timeout, async {
                let mut conn = self.connection().await?;
                let removed: u64 = redis::cmd("DEL").arg(&key).query_async(&mut conn).await?;
                Ok::<_, BackendError>(removed)
            })
            .await?;

        if removed > 0 {
            debug!(key = %key, "Token bucket reset");
        }
        Ok(())
    }

    async fn inspect(&self, identifier: &Identifier) -> Result<BucketSnapshot, BackendError> {
        let key = self.key_for(identifier);
        self.bounded(self.command_timeout, self.run_inspect(&key)).await
    }
}

fn parse_number(raw: &str, field: &str) -> Result<f64, BackendError> {
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() => Ok(value),
        _ => Err(BackendError::MalformedState(format!(
            "{} is not a number: {:?}",
            field, raw
        ))),
    }
}

fn unix_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

fn from_unix_seconds(seconds: f64) -> Result<DateTime<Utc>, BackendError> {
    DateTime::<Utc>::from_timestamp_millis((seconds * 1000.0).round() as i64).ok_or_else(|| {
        BackendError::MalformedState(format!("last_refill out of range: {}", seconds))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::Arc;

    /// Live tests only run when this points at a disposable Redis.
    const TEST_REDIS_URL_ENV: &str = "TOKENGATE_TEST_REDIS_URL";

    fn unreachable_backend() -> RedisBackend {
        let config = BucketConfig::new(10, 1.0, 1).unwrap();
        let mut settings = RedisSettings::new("redis://127.0.0.1:1/");
        settings.command_timeout = Duration::from_millis(200);
        RedisBackend::new(config, settings).unwrap()
    }

    fn live_backend(capacity: u32, refill_rate: f64, prefix: &str) -> Option<RedisBackend> {
        let url = std::env::var(TEST_REDIS_URL_ENV).ok()?;
        let config = BucketConfig::new(capacity, refill_rate, 1).unwrap();
        let mut settings = RedisSettings::new(url);
        settings.key_prefix = format!("tokengate-test:{}:{}", prefix, std::process::id());
        settings.command_timeout = Duration::from_secs(2);
        Some(RedisBackend::new(config, settings).unwrap())
    }

    #[test]
    fn test_key_is_namespaced() {
        let config = BucketConfig::new(10, 1.0, 1).unwrap();
        let settings = RedisSettings::new("redis://localhost:6379");
        let backend = RedisBackend::new(config, settings).unwrap();
        let key = backend.key_for(&Identifier::new("user:42:/api/v1/me"));
        assert_eq!(key, "rate_limit:bucket:user:42:/api/v1/me");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = BucketConfig::new(10, 1.0, 1).unwrap();
        assert!(RedisBackend::new(config, RedisSettings::new("not a url")).is_err());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("12.5", "tokens").unwrap(), 12.5);
        assert_eq!(parse_number("0", "tokens").unwrap(), 0.0);
        assert!(matches!(
            parse_number("abc", "tokens"),
            Err(BackendError::MalformedState(_))
        ));
        assert!(parse_number("nan", "tokens").is_err());
    }

    #[test]
    fn test_script_wait_saturates() {
        // A refill rate of 1e-20 makes the script report a wait of about 1e20 seconds
        let wait = parse_number("1e+20", "wait").unwrap();
        assert_eq!(wait_from_secs(wait), Duration::MAX);
        assert_eq!(wait_from_secs(-0.5), Duration::ZERO);
        assert_eq!(wait_from_secs(1.5), Duration::from_millis(1500));
    }

    #[test]
    fn test_unix_seconds_keeps_milliseconds() {
        let time = DateTime::<Utc>::from_timestamp_millis(1_700_000_000_123).unwrap();
        let seconds = unix_seconds(time);
        assert_eq!(from_unix_seconds(seconds).unwrap(), time);
    }

    #[tokio::test]
    async fn test_unreachable_store_is_unavailable() {
        let backend = unreachable_backend();
        let id = Identifier::new("ip:127.0.0.1");

        let err = backend.allow(&id, 1).await.unwrap_err();
        assert!(matches!(
            err,
            BackendError::Unavailable(_) | BackendError::Timeout(_)
        ));
        assert!(backend.ping(Duration::from_millis(200)).await.is_err());
        assert!(backend.inspect(&id).await.is_err());
        assert!(backend.reset(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_live_exhaustion_and_reset() {
        let Some(backend) = live_backend(5, 0.001, "exhaust") else {
            return;
        };
        let id = Identifier::new("user:exhaust");
        backend.reset(&id).await.unwrap();

        for i in 1..=5 {
            let decision = backend.allow(&id, 1).await.unwrap();
            assert!(decision.allowed, "Request {} should be allowed", i);
        }
        let decision = backend.allow(&id, 1).await.unwrap();
        assert!(!decision.allowed);
        assert!(decision.remaining < 1.0);
        assert!(decision.wait > Duration::from_secs(900));

        let snapshot = backend.inspect(&id).await.unwrap();
        assert!(snapshot.tokens < 1.0);

        backend.reset(&id).await.unwrap();
        let snapshot = backend.inspect(&id).await.unwrap();
        assert_eq!(snapshot.tokens, 5.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_live_concurrent_callers_never_double_spend() {
        let Some(backend) = live_backend(50, 0.001, "concurrent") else {
            return;
        };
        let backend = Arc::new(backend);
        let id = Identifier::new("user:contended");
        backend.reset(&id).await.unwrap();

        let calls = (0..50).map(|_| {
            let backend = Arc::clone(&backend);
            let id = id.clone();
            tokio::spawn(async move { backend.allow(&id, 1).await.unwrap().allowed })
        });
        let allowed = join_all(calls)
            .await
            .into_iter()
            .filter(|result| *result.as_ref().unwrap())
            .count();

        assert_eq!(allowed, 50);
        assert!(!backend.allow(&id, 1).await.unwrap().allowed);

        backend.reset(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_record_has_expiry() {
        let Some(backend) = live_backend(5, 1.0, "ttl") else {
            return;
        };
        let id = Identifier::new("user:ttl");
        backend.allow(&id, 1).await.unwrap();

        let mut conn = backend.connection().await.unwrap();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(backend.key_for(&id))
            .query_async(&mut conn)
            .await
            .unwrap();
        assert!(ttl > 0 && ttl <= 300_000);

        backend.reset(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_live_corrupt_record_is_malformed() {
        let Some(backend) = live_backend(5, 1.0, "corrupt") else {
            return;
        };
        let id = Identifier::new("user:corrupt");
        let key = backend.key_for(&id);

        let mut conn = backend.connection().await.unwrap();
        let _: () = redis::cmd("HSET")
            .arg(&key)
            .arg("tokens")
            .arg("lots")
            .arg("last_refill")
            .arg("yesterday")
            .query_async(&mut conn)
            .await
            .unwrap();

        let err = backend.allow(&id, 1).await.unwrap_err();
        assert!(matches!(err, BackendError::MalformedState(_)));
        let err = backend.inspect(&id).await.unwrap_err();
        assert!(matches!(err, BackendError::MalformedState(_)));

        backend.reset(&id).await.unwrap();
    }
}
