//! Configuration management
//!
//! Every field is defaulted so a config file only needs to name what it
//! changes. Durations are expressed in milliseconds to match the environment
//! variable surface.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::constants::{
    DEFAULT_BACKOFF_FACTOR, DEFAULT_BASE_DELAY_MS, DEFAULT_DRIVER, DEFAULT_FAILURE_THRESHOLD,
    DEFAULT_HALF_OPEN_MAX_CALLS, DEFAULT_LOG_LEVEL, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS,
    DEFAULT_MAX_IN_FLIGHT, DEFAULT_MEMORY_BUFFER, DEFAULT_QUEUE_CAPACITY, DEFAULT_RATE_LIMIT,
    DEFAULT_RATE_WINDOW_MS, DEFAULT_REDIS_PORT, DEFAULT_RESET_TIMEOUT_MS,
    DEFAULT_SUCCESS_THRESHOLD,
};
use crate::errors::DomainError;

/// Top-level PubGuard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PubSubConfig {
    /// Registered driver identifier (`memory`, `redis`, `kafka`, ...)
    pub driver: String,
    pub options: DriverOptions,
    pub resilience: ResilienceSettings,
    /// Deadline applied to calls that do not carry their own
    pub default_timeout_ms: Option<u64>,
    pub logging: LoggingConfig,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            driver: DEFAULT_DRIVER.to_string(),
            options: DriverOptions::default(),
            resilience: ResilienceSettings::default(),
            default_timeout_ms: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl PubSubConfig {
    /// Configuration for the given driver with default knobs
    pub fn for_driver(driver: impl Into<String>) -> Self {
        Self { driver: driver.into(), ..Self::default() }
    }
}

/// Backend connection options, one typed section per built-in backend
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    pub redis: Option<RedisOptions>,
    pub kafka: Option<KafkaOptions>,
    pub google_pubsub: Option<GooglePubSubOptions>,
    pub memory: MemoryOptions,
    /// Options for custom drivers, keyed however the driver expects
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    pub url: Option<String>,
    pub host: Option<String>,
    pub port: u16,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub db: u32,
    pub key_prefix: Option<String>,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: None,
            host: None,
            port: DEFAULT_REDIS_PORT,
            password: None,
            db: 0,
            key_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KafkaOptions {
    pub brokers: Vec<String>,
    pub client_id: String,
    pub group_id: Option<String>,
    pub ssl: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GooglePubSubOptions {
    pub project_id: String,
    pub key_filename: Option<String>,
    pub api_endpoint: Option<String>,
    pub subscription_prefix: Option<String>,
}

/// In-memory driver options
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryOptions {
    /// Per-topic delivery buffer; publishers wait when it is full
    pub buffer_size: usize,
    /// How many times a message whose handlers failed is redelivered
    pub max_redeliveries: u32,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self { buffer_size: DEFAULT_MEMORY_BUFFER, max_redeliveries: 0 }
    }
}

/// Resilience knobs shared by the publish path and the delivery path
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceSettings {
    pub circuit_breaker: CircuitBreakerSettings,
    pub retry: RetrySettings,
    pub rate_limit: RateLimitSettings,
    pub backpressure: BackpressureSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u64,
    pub reset_timeout_ms: u64,
    pub success_threshold: u64,
    /// Count failures inside a sliding window instead of consecutively
    pub window_time_ms: Option<u64>,
    pub half_open_max_calls: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_ms: DEFAULT_RESET_TIMEOUT_MS,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            window_time_ms: None,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

/// Backoff strategy names accepted in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    #[default]
    Exponential,
    Linear,
    Fixed,
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Exponential => "exponential",
            Self::Linear => "linear",
            Self::Fixed => "fixed",
        })
    }
}

impl FromStr for BackoffKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exponential" => Ok(Self::Exponential),
            "linear" => Ok(Self::Linear),
            "fixed" => Ok(Self::Fixed),
            other => Err(DomainError::InvalidConfig(format!("unknown backoff strategy '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub strategy: BackoffKind,
    /// Multiplier for exponential backoff
    pub factor: f64,
    /// Step added per retry for linear backoff; defaults to `base_delay_ms`
    pub increment_ms: Option<u64>,
    /// Randomise each delay uniformly in `[0, delay]`
    pub jitter: bool,
    /// Give up once this much time has passed since the first attempt
    pub max_total_time_ms: Option<u64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            strategy: BackoffKind::Exponential,
            factor: DEFAULT_BACKOFF_FACTOR,
            increment_ms: None,
            jitter: false,
            max_total_time_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    FixedWindow,
    TokenBucket,
}

/// What a caller experiences when the limiter has no permit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Fail immediately with a rate-limited error
    #[default]
    Reject,
    /// Wait for a permit, bounded by the call deadline
    Wait,
}

impl FromStr for RateLimitAlgorithm {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "fixed_window" => Ok(Self::FixedWindow),
            "token_bucket" => Ok(Self::TokenBucket),
            other => Err(DomainError::InvalidConfig(format!("unknown rate limit algorithm '{other}'"))),
        }
    }
}

impl FromStr for RateLimitMode {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "reject" => Ok(Self::Reject),
            "wait" => Ok(Self::Wait),
            other => Err(DomainError::InvalidConfig(format!("unknown rate limit mode '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub limit: u64,
    pub duration_ms: u64,
    pub algorithm: RateLimitAlgorithm,
    pub mode: RateLimitMode,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: DEFAULT_RATE_LIMIT,
            duration_ms: DEFAULT_RATE_WINDOW_MS,
            algorithm: RateLimitAlgorithm::FixedWindow,
            mode: RateLimitMode::Reject,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureSettings {
    pub enabled: bool,
    pub max_in_flight: usize,
    /// Bounded FIFO of waiters; 0 rejects immediately at capacity
    pub queue_capacity: usize,
    pub queue_timeout_ms: Option<u64>,
}

impl Default for BackpressureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            queue_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(DomainError::InvalidConfig(format!("unknown log format '{other}'"))),
        }
    }
}

/// Logging configuration consumed by the tracing initialiser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: DEFAULT_LOG_LEVEL.to_string(), format: LogFormat::Pretty }
    }
}
