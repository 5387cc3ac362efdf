//! Configuration management for Tokengate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{Result, TokengateError};
use crate::ratelimit::{BucketConfig, EvictionPolicy, KeyScope, RedisSettings, DEFAULT_KEY_PREFIX};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "TOKENGATE";

/// Main configuration for the Tokengate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokengateConfig {
    /// Deployment environment, e.g. `development` or `production`
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

impl Default for TokengateConfig {
    fn default() -> Self {
        Self {
            environment: default_environment(),
            server: ServerConfig::default(),
            rate_limiting: RateLimitingConfig::default(),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
        }
    }
}

/// Which bucket store to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Redis in production and staging, memory everywhere else
    #[default]
    Auto,
    /// In-process buckets
    Memory,
    /// Buckets shared through Redis
    Redis,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Whether calls are limited at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Sustained request budget per caller; also the burst size
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Bucket store selection
    #[serde(default)]
    pub backend: BackendKind,

    /// Give each route its own budget
    #[serde(default)]
    pub per_route: bool,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub redis: RedisConfig,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            requests_per_minute: default_requests_per_minute(),
            backend: BackendKind::default(),
            per_route: false,
            memory: MemoryConfig::default(),
            redis: RedisConfig::default(),
        }
    }
}

/// In-memory store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Seconds between idle-bucket sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Seconds a bucket may sit unused before it is swept
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
            idle_timeout_secs: default_idle_timeout(),
        }
    }
}

/// Redis store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Namespace for bucket keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Seconds an untouched bucket record lives
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Milliseconds allowed for one round trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl(),
            command_timeout_ms: default_command_timeout(),
        }
    }
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_enabled() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_ttl() -> u64 {
    300
}

fn default_command_timeout() -> u64 {
    500
}

impl TokengateConfig {
    /// Load defaults, then the optional YAML file, then `TOKENGATE_*`
    /// environment overrides such as `TOKENGATE_RATE_LIMITING__REQUESTS_PER_MINUTE`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with(path, environment_source())
    }

    fn load_with(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: TokengateConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        if rl.requests_per_minute == 0 {
            return Err(TokengateError::Config(
                "rate_limiting.requests_per_minute must be greater than zero".to_string(),
            ));
        }
        if rl.memory.sweep_interval_secs == 0 || rl.memory.idle_timeout_secs == 0 {
            return Err(TokengateError::Config(
                "rate_limiting.memory intervals must be greater than zero".to_string(),
            ));
        }
        if rl.redis.ttl_secs == 0 || rl.redis.command_timeout_ms == 0 {
            return Err(TokengateError::Config(
                "rate_limiting.redis ttl and timeout must be greater than zero".to_string(),
            ));
        }
        if rl.redis.key_prefix.is_empty() {
            return Err(TokengateError::Config(
                "rate_limiting.redis.key_prefix must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The store to run, with `auto` resolved against the environment.
    pub fn resolved_backend(&self) -> BackendKind {
        match self.rate_limiting.backend {
            BackendKind::Auto => match self.environment.as_str() {
                "production" | "staging" => BackendKind::Redis,
                _ => BackendKind::Memory,
            },
            kind => kind,
        }
    }
}

impl RateLimitingConfig {
    pub fn bucket_config(&self) -> Result<BucketConfig> {
        BucketConfig::from_requests_per_minute(self.requests_per_minute)
    }

    pub fn key_scope(&self) -> KeyScope {
        if self.per_route {
            KeyScope::PerRoute
        } else {
            KeyScope::PerCaller
        }
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            sweep_interval: Duration::from_secs(self.memory.sweep_interval_secs),
            idle_timeout: Duration::from_secs(self.memory.idle_timeout_secs),
        }
    }

    pub fn redis_settings(&self) -> RedisSettings {
        RedisSettings {
            url: self.redis.url.clone(),
            key_prefix: self.redis.key_prefix.clone(),
            ttl: Duration::from_secs(self.redis.ttl_secs),
            command_timeout: Duration::from_millis(self.redis.command_timeout_ms),
        }
    }
}

fn environment_source() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
