//! Domain constants
//!
//! Defaults used by the configuration structures and the in-memory driver.

// Driver identifiers
pub const DRIVER_MEMORY: &str = "memory";
pub const DRIVER_REDIS: &str = "redis";
pub const DRIVER_KAFKA: &str = "kafka";
pub const DRIVER_GOOGLE_PUBSUB: &str = "google-pubsub";
pub const DEFAULT_DRIVER: &str = DRIVER_MEMORY;

// Circuit breaker defaults
pub const DEFAULT_FAILURE_THRESHOLD: u64 = 5;
pub const DEFAULT_SUCCESS_THRESHOLD: u64 = 1;
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HALF_OPEN_MAX_CALLS: u64 = 1;

// Retry defaults
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

// Rate limiting defaults
pub const DEFAULT_RATE_LIMIT: u64 = 100;
pub const DEFAULT_RATE_WINDOW_MS: u64 = 1_000;

// Backpressure defaults
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100;
pub const DEFAULT_QUEUE_CAPACITY: usize = 0;

// In-memory driver defaults
pub const DEFAULT_MEMORY_BUFFER: usize = 1_024;
pub const DEFAULT_REDIS_PORT: u16 = 6379;

// Logging
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Prefix for environment variable configuration (`PUBGUARD_DRIVER`, ...)
pub const ENV_PREFIX: &str = "PUBGUARD_";
