//! Integration tests for configuration loading
//!
//! Tests the path from a config file on disk to a running service.

use std::path::PathBuf;

use pubguard_core::PubSubError;
use pubguard_domain::{BackoffKind, LogFormat, RateLimitMode};
use pubguard_infra::{config, service_from_config};
use tempfile::TempDir;

fn write_config(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).expect("Failed to write config file");
    path
}

/// Validates a JSON file with every section set.
///
/// # Test Steps
/// 1. Write a JSON config for the memory driver with custom knobs
/// 2. Load it and verify each section
/// 3. Build a service from it and verify the guards picked the knobs up
#[tokio::test]
async fn test_json_config_builds_service() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(
        &dir,
        "pubguard.json",
        r#"{
            "driver": "memory",
            "default_timeout_ms": 1500,
            "options": { "memory": { "buffer_size": 16, "max_redeliveries": 1 } },
            "resilience": {
                "circuit_breaker": { "failure_threshold": 2, "reset_timeout_ms": 500 },
                "retry": { "max_attempts": 4, "strategy": "fixed", "base_delay_ms": 20 },
                "rate_limit": { "enabled": true, "limit": 50, "duration_ms": 1000, "mode": "wait" },
                "backpressure": { "max_in_flight": 8, "queue_capacity": 4 }
            },
            "logging": { "level": "debug", "format": "json" }
        }"#,
    );

    let loaded = config::load_from_file(Some(path)).expect("Failed to load JSON config");

    assert_eq!(loaded.driver, "memory");
    assert_eq!(loaded.default_timeout_ms, Some(1_500));
    assert_eq!(loaded.options.memory.buffer_size, 16);
    assert_eq!(loaded.resilience.retry.strategy, BackoffKind::Fixed);
    assert_eq!(loaded.resilience.rate_limit.mode, RateLimitMode::Wait);
    assert_eq!(loaded.logging.format, LogFormat::Json);

    let service = service_from_config(&loaded).expect("Failed to build service");
    service.connect().await.expect("Failed to connect");

    let stats = service.guard_stats();
    assert_eq!(stats.publish.backpressure.expect("backpressure").max_in_flight, 8);
    assert_eq!(stats.publish.rate_limit_available, Some(50));
    assert!(stats.delivery.circuit.is_some());

    service.disconnect().await;
}

/// Validates that an unknown driver id in a TOML file fails at service
/// construction with the list of known drivers.
#[test]
fn test_toml_config_with_unknown_driver() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(
        &dir,
        "config.toml",
        r#"
driver = "redis"

[options.redis]
host = "localhost"
"#,
    );

    let loaded = config::load_from_file(Some(path)).expect("Failed to load TOML config");
    let err = service_from_config(&loaded).unwrap_err();

    match err {
        PubSubError::DriverNotFound { driver, known } => {
            assert_eq!(driver, "redis");
            assert_eq!(known, vec!["memory".to_string()]);
        }
        other => panic!("Expected DriverNotFound, got {other:?}"),
    }
}

/// Validates that invalid resilience knobs surface as configuration errors.
#[test]
fn test_invalid_resilience_settings_rejected() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let path = write_config(
        &dir,
        "config.json",
        r#"{ "resilience": { "retry": { "max_attempts": 0 } } }"#,
    );

    let loaded = config::load_from_file(Some(path))?;
    let err = service_from_config(&loaded).unwrap_err();
    assert!(matches!(err, PubSubError::Config(_)), "Expected Config error, got {err:?}");
    Ok(())
}

#[test]
fn test_load_config_with_invalid_format() {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = write_config(&dir, "config.json", r#"{ "driver": "#);

    match config::load_from_file(Some(path)) {
        Err(PubSubError::Config(msg)) => {
            assert!(msg.contains("Invalid JSON"), "Error message should mention invalid JSON");
        }
        other => panic!("Expected Config error, got {other:?}"),
    }
}
