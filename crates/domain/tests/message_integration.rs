//! Integration tests for the message envelope and configuration types
//!
//! Covers the wire shape a serializing driver produces and consumes, and the
//! way partially specified configuration documents fall back to defaults.

use std::collections::HashMap;

use pubguard_domain::{
    BackoffKind, DeliveryResilience, LogFormat, Message, MessageAttributes, PubSubConfig,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct InvoicePaid {
    invoice_id: String,
    amount_cents: u64,
}

/// Test the envelope survives a serializing driver hop
///
/// Scenario: a publisher attaches metadata and attributes, the driver writes
/// the wire JSON, and the consumer side decodes the typed payload.
#[test]
fn test_envelope_survives_driver_hop() {
    let event = InvoicePaid { invoice_id: "inv-42".into(), amount_cents: 9_900 };
    let mut attributes = MessageAttributes::new();
    attributes.insert("tenant".into(), "acme".into());
    let mut metadata = HashMap::new();
    metadata.insert("trace_id".to_string(), json!("abc123"));

    let sent = Message::from_payload("billing.invoice_paid", &event)
        .expect("payload serializes")
        .with_metadata(metadata)
        .with_attributes(attributes);

    let wire = sent.to_json().expect("envelope serializes");
    let received = Message::from_json(&wire).expect("envelope parses");

    assert_eq!(received, sent);
    assert_eq!(received.payload::<InvoicePaid>().expect("typed payload"), event);
    assert_eq!(received.attribute("tenant"), Some("acme"));
    assert_eq!(received.metadata.as_ref().and_then(|m| m.get("trace_id")), Some(&json!("abc123")));
}

/// Test a JSON config document with only a few overrides
#[test]
fn test_json_config_with_overrides() {
    let raw = r#"{
        "driver": "google-pubsub",
        "options": { "google_pubsub": { "project_id": "prod-123" } },
        "resilience": {
            "circuit_breaker": { "failure_threshold": 3, "window_time_ms": 60000 },
            "retry": { "strategy": "fixed", "base_delay_ms": 250 },
            "backpressure": { "max_in_flight": 8, "queue_capacity": 32 }
        },
        "default_timeout_ms": 5000,
        "logging": { "level": "debug", "format": "json" }
    }"#;

    let config: PubSubConfig = serde_json::from_str(raw).expect("config parses");

    assert_eq!(config.driver, "google-pubsub");
    assert_eq!(config.options.google_pubsub.map(|g| g.project_id), Some("prod-123".into()));
    assert_eq!(config.resilience.circuit_breaker.failure_threshold, 3);
    assert_eq!(config.resilience.circuit_breaker.window_time_ms, Some(60_000));
    assert_eq!(config.resilience.circuit_breaker.reset_timeout_ms, 30_000);
    assert_eq!(config.resilience.retry.strategy, BackoffKind::Fixed);
    assert_eq!(config.resilience.backpressure.queue_capacity, 32);
    assert_eq!(config.default_timeout_ms, Some(5_000));
    assert_eq!(config.logging.format, LogFormat::Json);
}

/// Test unknown driver options are kept for custom drivers
#[test]
fn test_extra_options_preserved() {
    let raw = r#"{ "driver": "nats", "options": { "extra": { "servers": ["nats://a:4222"] } } }"#;
    let config: PubSubConfig = serde_json::from_str(raw).expect("config parses");
    assert_eq!(config.options.extra.get("servers"), Some(&json!(["nats://a:4222"])));
    assert_eq!(DeliveryResilience::default(), DeliveryResilience {
        retry: true,
        circuit_breaker: true,
        rate_limit: true,
        backpressure: true,
    });
}
