//! Configuration loader
//!
//! Loads [`PubSubConfig`] from environment variables or files.
//!
//! ## Loading Strategy
//! 1. Reads a `.env` file into the process environment when one exists
//! 2. Attempts to load from `PUBGUARD_*` environment variables
//! 3. If `PUBGUARD_DRIVER` is unset, falls back to loading from file
//! 4. Probes multiple paths for config files (JSON or TOML)
//!
//! ## Environment Variables
//! Only `PUBGUARD_DRIVER` is required; every other knob keeps its default
//! when unset.
//!
//! | Variable | Field |
//! |----------|-------|
//! | `PUBGUARD_DRIVER` | `driver` |
//! | `PUBGUARD_DEFAULT_TIMEOUT_MS` | `default_timeout_ms` |
//! | `PUBGUARD_REDIS_URL`, `_HOST`, `_PORT`, `_PASSWORD`, `_DB`, `_KEY_PREFIX` | `options.redis` |
//! | `PUBGUARD_KAFKA_BROKERS` (comma separated), `_CLIENT_ID`, `_GROUP_ID`, `_SSL` | `options.kafka` |
//! | `PUBGUARD_GOOGLE_PROJECT_ID`, `_KEY_FILENAME`, `_API_ENDPOINT`, `_SUBSCRIPTION_PREFIX` | `options.google_pubsub` |
//! | `PUBGUARD_MEMORY_BUFFER_SIZE`, `_MAX_REDELIVERIES` | `options.memory` |
//! | `PUBGUARD_CB_ENABLED`, `_FAILURE_THRESHOLD`, `_SUCCESS_THRESHOLD`, `_RESET_TIMEOUT_MS`, `_WINDOW_MS`, `_HALF_OPEN_MAX_CALLS` | `resilience.circuit_breaker` |
//! | `PUBGUARD_RETRY_ENABLED`, `_MAX_ATTEMPTS`, `_BASE_DELAY_MS`, `_MAX_DELAY_MS`, `_STRATEGY`, `_FACTOR`, `_INCREMENT_MS`, `_JITTER`, `_MAX_TOTAL_TIME_MS` | `resilience.retry` |
//! | `PUBGUARD_RATE_LIMIT_ENABLED`, `_LIMIT`, `_DURATION_MS`, `_ALGORITHM`, `_MODE` | `resilience.rate_limit` |
//! | `PUBGUARD_BACKPRESSURE_ENABLED`, `_MAX_IN_FLIGHT`, `_QUEUE_CAPACITY`, `_QUEUE_TIMEOUT_MS` | `resilience.backpressure` |
//! | `PUBGUARD_LOG_LEVEL`, `PUBGUARD_LOG_FORMAT` | `logging` |
//!
//! ## File Locations
//! The loader probes the following paths (in order):
//! 1. `./config.{json,toml}` then `./pubguard.{json,toml}`
//! 2. The same names in the parent and grandparent directories
//! 3. The same names relative to the executable location

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use pubguard_core::{PubSubError, Result};
use pubguard_domain::{
    GooglePubSubOptions, KafkaOptions, PubSubConfig, RedisOptions, ENV_PREFIX,
};

const CONFIG_STEMS: [&str; 2] = ["config", "pubguard"];
const CONFIG_EXTENSIONS: [&str; 2] = ["json", "toml"];

/// Load configuration with automatic fallback strategy
///
/// Reads `.env` first, then tries the environment, then a config file.
///
/// # Errors
/// Returns `PubSubError::Config` if:
/// - An environment variable is set but invalid
/// - No config file is found after the environment is incomplete
/// - The file format is invalid
pub fn load() -> Result<PubSubConfig> {
    match dotenvy::dotenv() {
        Ok(path) => tracing::debug!(path = %path.display(), "Loaded .env file"),
        Err(e) if e.not_found() => {}
        Err(e) => tracing::warn!(error = %e, "Ignoring unreadable .env file"),
    }

    if std::env::var(env_key("DRIVER")).is_err() {
        tracing::debug!("PUBGUARD_DRIVER not set, loading configuration from file");
        return load_from_file(None);
    }

    let config = load_from_env()?;
    tracing::info!(driver = %config.driver, "Configuration loaded from environment variables");
    Ok(config)
}

/// Load configuration from `PUBGUARD_*` environment variables
///
/// See module documentation for the complete list. Unset knobs keep their
/// defaults; driver sections are only created when one of their variables
/// is set.
///
/// # Errors
/// Returns `PubSubError::Config` if `PUBGUARD_DRIVER` is missing or any set
/// variable fails to parse.
pub fn load_from_env() -> Result<PubSubConfig> {
    let mut config = PubSubConfig::for_driver(env_var("DRIVER")?);

    if let Some(timeout) = env_parse("DEFAULT_TIMEOUT_MS")? {
        config.default_timeout_ms = Some(timeout);
    }

    apply_driver_options(&mut config)?;
    apply_resilience(&mut config)?;

    if let Some(level) = env_opt("LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(format) = env_parse("LOG_FORMAT")? {
        config.logging.format = format;
    }

    Ok(config)
}

fn apply_driver_options(config: &mut PubSubConfig) -> Result<()> {
    let options = &mut config.options;

    let redis_url = env_opt("REDIS_URL");
    let redis_host = env_opt("REDIS_HOST");
    if redis_url.is_some() || redis_host.is_some() {
        let mut redis = RedisOptions {
            url: redis_url,
            host: redis_host,
            password: env_opt("REDIS_PASSWORD"),
            key_prefix: env_opt("REDIS_KEY_PREFIX"),
            ..RedisOptions::default()
        };
        if let Some(port) = env_parse("REDIS_PORT")? {
            redis.port = port;
        }
        if let Some(db) = env_parse("REDIS_DB")? {
            redis.db = db;
        }
        options.redis = Some(redis);
    }

    if let Some(brokers) = env_opt("KAFKA_BROKERS") {
        options.kafka = Some(KafkaOptions {
            brokers: brokers
                .split(',')
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(String::from)
                .collect(),
            client_id: env_opt("KAFKA_CLIENT_ID").unwrap_or_default(),
            group_id: env_opt("KAFKA_GROUP_ID"),
            ssl: env_bool("KAFKA_SSL", false),
        });
    }

    if let Some(project_id) = env_opt("GOOGLE_PROJECT_ID") {
        options.google_pubsub = Some(GooglePubSubOptions {
            project_id,
            key_filename: env_opt("GOOGLE_KEY_FILENAME"),
            api_endpoint: env_opt("GOOGLE_API_ENDPOINT"),
            subscription_prefix: env_opt("GOOGLE_SUBSCRIPTION_PREFIX"),
        });
    }

    if let Some(buffer_size) = env_parse("MEMORY_BUFFER_SIZE")? {
        options.memory.buffer_size = buffer_size;
    }
    if let Some(max_redeliveries) = env_parse("MEMORY_MAX_REDELIVERIES")? {
        options.memory.max_redeliveries = max_redeliveries;
    }

    Ok(())
}

fn apply_resilience(config: &mut PubSubConfig) -> Result<()> {
    let resilience = &mut config.resilience;

    let breaker = &mut resilience.circuit_breaker;
    breaker.enabled = env_bool("CB_ENABLED", breaker.enabled);
    set_parsed("CB_FAILURE_THRESHOLD", &mut breaker.failure_threshold)?;
    set_parsed("CB_SUCCESS_THRESHOLD", &mut breaker.success_threshold)?;
    set_parsed("CB_RESET_TIMEOUT_MS", &mut breaker.reset_timeout_ms)?;
    set_parsed("CB_HALF_OPEN_MAX_CALLS", &mut breaker.half_open_max_calls)?;
    if let Some(window) = env_parse("CB_WINDOW_MS")? {
        breaker.window_time_ms = Some(window);
    }

    let retry = &mut resilience.retry;
    retry.enabled = env_bool("RETRY_ENABLED", retry.enabled);
    retry.jitter = env_bool("RETRY_JITTER", retry.jitter);
    set_parsed("RETRY_MAX_ATTEMPTS", &mut retry.max_attempts)?;
    set_parsed("RETRY_BASE_DELAY_MS", &mut retry.base_delay_ms)?;
    set_parsed("RETRY_MAX_DELAY_MS", &mut retry.max_delay_ms)?;
    set_parsed("RETRY_STRATEGY", &mut retry.strategy)?;
    set_parsed("RETRY_FACTOR", &mut retry.factor)?;
    if let Some(increment) = env_parse("RETRY_INCREMENT_MS")? {
        retry.increment_ms = Some(increment);
    }
    if let Some(budget) = env_parse("RETRY_MAX_TOTAL_TIME_MS")? {
        retry.max_total_time_ms = Some(budget);
    }

    let rate = &mut resilience.rate_limit;
    rate.enabled = env_bool("RATE_LIMIT_ENABLED", rate.enabled);
    set_parsed("RATE_LIMIT_LIMIT", &mut rate.limit)?;
    set_parsed("RATE_LIMIT_DURATION_MS", &mut rate.duration_ms)?;
    set_parsed("RATE_LIMIT_ALGORITHM", &mut rate.algorithm)?;
    set_parsed("RATE_LIMIT_MODE", &mut rate.mode)?;

    let backpressure = &mut resilience.backpressure;
    backpressure.enabled = env_bool("BACKPRESSURE_ENABLED", backpressure.enabled);
    set_parsed("BACKPRESSURE_MAX_IN_FLIGHT", &mut backpressure.max_in_flight)?;
    set_parsed("BACKPRESSURE_QUEUE_CAPACITY", &mut backpressure.queue_capacity)?;
    if let Some(timeout) = env_parse("BACKPRESSURE_QUEUE_TIMEOUT_MS")? {
        backpressure.queue_timeout_ms = Some(timeout);
    }

    Ok(())
}

/// Load configuration from a file
///
/// If `path` is `None`, probes multiple locations for config files.
/// Supports both JSON and TOML formats (detected by file extension).
///
/// # Errors
/// Returns `PubSubError::Config` if:
/// - File not found (when path is specified)
/// - No config file found (when path is `None`)
/// - File format is invalid
pub fn load_from_file(path: Option<PathBuf>) -> Result<PubSubConfig> {
    let config_path = match path {
        Some(p) => {
            if !p.exists() {
                return Err(PubSubError::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            p
        }
        None => probe_config_paths().ok_or_else(|| {
            PubSubError::Config("No config file found in any of the standard locations".into())
        })?,
    };

    tracing::info!(path = %config_path.display(), "Loading configuration from file");

    let contents = std::fs::read_to_string(&config_path)
        .map_err(|e| PubSubError::Config(format!("Failed to read config file: {e}")))?;

    parse_config(&contents, &config_path)
}

/// Parse configuration from string content
///
/// Format is detected by file extension (`.json` or `.toml`).
fn parse_config(contents: &str, path: &Path) -> Result<PubSubConfig> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("json");

    match extension {
        "toml" => toml::from_str(contents)
            .map_err(|e| PubSubError::Config(format!("Invalid TOML format: {e}"))),
        "json" => serde_json::from_str(contents)
            .map_err(|e| PubSubError::Config(format!("Invalid JSON format: {e}"))),
        _ => Err(PubSubError::Config(format!("Unsupported config format: {extension}"))),
    }
}

/// Probe multiple paths for configuration files
///
/// # Returns
/// The first config file found, or `None` if no file exists.
pub fn probe_config_paths() -> Option<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(cwd) = std::env::current_dir() {
        roots.extend([cwd.clone(), cwd.join(".."), cwd.join("../..")]);
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            roots.extend([exe_dir.to_path_buf(), exe_dir.join(".."), exe_dir.join("../..")]);
        }
    }

    roots
        .iter()
        .flat_map(|root| {
            CONFIG_STEMS.iter().flat_map(move |stem| {
                CONFIG_EXTENSIONS.iter().map(move |ext| root.join(format!("{stem}.{ext}")))
            })
        })
        .find(|path| path.exists())
}

fn env_key(name: &str) -> String {
    format!("{ENV_PREFIX}{name}")
}

/// Get required environment variable
///
/// # Errors
/// Returns `PubSubError::Config` if the variable is not set.
fn env_var(name: &str) -> Result<String> {
    env_opt(name).ok_or_else(|| {
        PubSubError::Config(format!("Missing required environment variable: {}", env_key(name)))
    })
}

/// Optional variable; empty values count as unset
fn env_opt(name: &str) -> Option<String> {
    std::env::var(env_key(name)).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    env_opt(name)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                PubSubError::Config(format!("Invalid value for {}: {e}", env_key(name)))
            })
        })
        .transpose()
}

fn set_parsed<T>(name: &str, target: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: Display,
{
    if let Some(value) = env_parse(name)? {
        *target = value;
    }
    Ok(())
}

/// Parse boolean from environment variable
///
/// Accepts: `1`/`0`, `true`/`false`, `yes`/`no`, `on`/`off` (case-insensitive)
fn env_bool(name: &str, default: bool) -> bool {
    env_opt(name)
        .map(|s| matches!(s.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}
