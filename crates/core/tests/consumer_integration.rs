//! Integration tests for the consumer lifecycle.

mod support;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pubguard_common::error::BoxedError;
use pubguard_core::{
    Consumer, ConsumerSet, ConsumerState, HandlerResult, ManagedConsumer, PubSubDriver,
    PubSubError, PubSubService,
};
use pubguard_domain::{DeliveryResilience, Message, SubscribeOptions};
use serde_json::json;
use support::{fast_config, MockDriver};
use tokio::sync::Notify;

type Journal = Arc<Mutex<Vec<String>>>;

/// Consumer that journals every hook call
struct RecordingConsumer {
    name: String,
    topic: String,
    journal: Journal,
    fail_setup: bool,
    panic_in_setup: bool,
    fail_teardown: bool,
    setup_gate: Option<Arc<Notify>>,
}

impl RecordingConsumer {
    fn new(name: &str, topic: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            topic: topic.to_string(),
            journal: Arc::clone(journal),
            fail_setup: false,
            panic_in_setup: false,
            fail_teardown: false,
            setup_gate: None,
        }
    }

    fn record(&self, event: &str) {
        self.journal.lock().push(format!("{}:{event}", self.name));
    }
}

#[async_trait]
impl Consumer for RecordingConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    fn topic(&self) -> &str {
        &self.topic
    }

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::new().resilience(DeliveryResilience::none())
    }

    async fn on_subscribe(&self) -> Result<(), BoxedError> {
        if let Some(gate) = &self.setup_gate {
            gate.notified().await;
        }
        self.record("subscribed");
        if self.panic_in_setup {
            panic!("cache warmup crashed");
        }
        if self.fail_setup {
            return Err("warmup query failed".into());
        }
        Ok(())
    }

    async fn handle(&self, message: Arc<Message>) -> HandlerResult {
        self.record(&format!("handle {}", message.data));
        Ok(())
    }

    async fn on_unsubscribe(&self) -> Result<(), BoxedError> {
        self.record("unsubscribed");
        if self.fail_teardown {
            return Err("flush failed".into());
        }
        Ok(())
    }
}

async fn connected_service(driver: &Arc<MockDriver>) -> PubSubService {
    let driver: Arc<dyn PubSubDriver> = Arc::clone(driver) as Arc<dyn PubSubDriver>;
    let service = PubSubService::new(driver, &fast_config()).expect("valid config");
    service.connect().await.expect("connect");
    service
}

/// Validates the full lifecycle of a single consumer.
///
/// # Test Steps
/// 1. Start the consumer and verify it is active with a subscription
/// 2. Deliver a message and verify `handle` sees it
/// 3. Stop the consumer and verify teardown ran and the topic is gone
#[tokio::test]
async fn test_consumer_lifecycle() {
    let driver = MockDriver::new();
    let service = connected_service(&driver).await;
    let journal = Journal::default();
    let consumer = ManagedConsumer::new(Arc::new(RecordingConsumer::new("audit", "orders", &journal)));
    assert_eq!(consumer.state(), ConsumerState::Created);

    consumer.start(&service).await.expect("start");
    assert_eq!(consumer.state(), ConsumerState::Active);
    assert!(consumer.subscription().is_some());

    driver.deliver("orders", json!(1)).await.expect("deliver");

    consumer.stop(&service).await;
    assert_eq!(consumer.state(), ConsumerState::Unsubscribed);
    assert!(consumer.subscription().is_none());
    assert!(service.subscribed_topics().is_empty());
    assert_eq!(driver.unsubscribed(), vec!["orders".to_string()]);

    assert_eq!(
        *journal.lock(),
        vec!["audit:subscribed", "audit:handle 1", "audit:unsubscribed"]
    );

    let err = consumer.start(&service).await.unwrap_err();
    assert!(matches!(err, PubSubError::InvalidOptions(_)), "restart must be refused: {err:?}");
}

/// Validates that a failing `on_subscribe` removes the subscription again.
#[tokio::test]
async fn test_setup_failure_rolls_back_subscription() {
    let driver = MockDriver::new();
    let service = connected_service(&driver).await;
    let journal = Journal::default();
    let mut inner = RecordingConsumer::new("billing", "orders", &journal);
    inner.fail_setup = true;
    let consumer = ManagedConsumer::new(Arc::new(inner));

    let err = consumer.start(&service).await.unwrap_err();

    match err {
        PubSubError::ConsumerSetup { consumer, source } => {
            assert_eq!(consumer, "billing");
            assert_eq!(source.to_string(), "warmup query failed");
        }
        other => panic!("expected ConsumerSetup, got {other:?}"),
    }
    assert_eq!(consumer.state(), ConsumerState::Failed);
    assert!(service.subscribed_topics().is_empty());
    assert_eq!(driver.unsubscribed(), vec!["orders".to_string()]);

    // Stop on a failed consumer is a no-op.
    consumer.stop(&service).await;
    assert_eq!(*journal.lock(), vec!["billing:subscribed"]);
}

/// Validates that a panicking `on_subscribe` is reported as a setup error
/// and rolled back like a returned error.
#[tokio::test]
async fn test_setup_panic_rolls_back_subscription() {
    let driver = MockDriver::new();
    let service = connected_service(&driver).await;
    let journal = Journal::default();
    let mut inner = RecordingConsumer::new("billing", "orders", &journal);
    inner.panic_in_setup = true;
    let consumer = ManagedConsumer::new(Arc::new(inner));

    let err = consumer.start(&service).await.unwrap_err();

    assert!(
        matches!(err, PubSubError::ConsumerSetup { ref consumer, .. } if consumer == "billing"),
        "expected ConsumerSetup, got {err:?}"
    );
    assert_eq!(consumer.state(), ConsumerState::Failed);
    assert!(consumer.subscription().is_none());
    assert!(service.subscribed_topics().is_empty());
    assert!(!driver.has_backend_subscription("orders"));
}

/// Validates that `on_unsubscribe` errors are logged, not returned.
#[tokio::test]
async fn test_teardown_error_does_not_fail_stop() {
    let driver = MockDriver::new();
    let service = connected_service(&driver).await;
    let journal = Journal::default();
    let mut inner = RecordingConsumer::new("audit", "orders", &journal);
    inner.fail_teardown = true;
    let consumer = ManagedConsumer::new(Arc::new(inner));

    consumer.start(&service).await.expect("start");
    consumer.stop(&service).await;

    assert_eq!(consumer.state(), ConsumerState::Unsubscribed);
    assert_eq!(journal.lock().last().map(String::as_str), Some("audit:unsubscribed"));
}

/// Validates that messages arriving during `on_subscribe` wait for it.
///
/// # Test Steps
/// 1. Start a consumer whose setup blocks on a gate
/// 2. Deliver a message while setup is still running
/// 3. Release the gate and verify setup completed before `handle` ran
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_messages_wait_for_activation() {
    let driver = MockDriver::new();
    let service = connected_service(&driver).await;
    let journal = Journal::default();
    let gate = Arc::new(Notify::new());
    let mut inner = RecordingConsumer::new("audit", "orders", &journal);
    inner.setup_gate = Some(Arc::clone(&gate));
    let consumer = Arc::new(ManagedConsumer::new(Arc::new(inner)));

    let starting = tokio::spawn({
        let consumer = Arc::clone(&consumer);
        let service = service.clone();
        async move { consumer.start(&service).await }
    });
    while !driver.has_backend_subscription("orders") {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert_eq!(consumer.state(), ConsumerState::Subscribing);

    let delivering = tokio::spawn({
        let driver = Arc::clone(&driver);
        async move { driver.deliver("orders", json!("early")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(journal.lock().is_empty(), "handle ran before activation");

    gate.notify_one();
    starting.await.expect("start task").expect("start");
    delivering.await.expect("deliver task").expect("deliver");

    assert_eq!(*journal.lock(), vec!["audit:subscribed", "audit:handle \"early\""]);
}

/// Validates ordered start, reverse stop and rollback for a consumer set.
///
/// # Test Steps
/// 1. Register three consumers where the second fails setup
/// 2. Verify the first is stopped again and the third never started
/// 3. Start and stop a healthy set and verify reverse teardown order
#[tokio::test]
async fn test_consumer_set_start_rollback_and_stop_order() {
    let driver = MockDriver::new();
    let service = connected_service(&driver).await;
    let journal = Journal::default();

    let mut broken = RecordingConsumer::new("b", "payments", &journal);
    broken.fail_setup = true;
    let set = ConsumerSet::new()
        .with(Arc::new(RecordingConsumer::new("a", "orders", &journal)))
        .with(Arc::new(broken))
        .with(Arc::new(RecordingConsumer::new("c", "refunds", &journal)));
    assert_eq!(set.len(), 3);

    let err = set.start_all(&service).await.unwrap_err();
    assert!(matches!(err, PubSubError::ConsumerSetup { .. }), "unexpected error: {err:?}");
    assert_eq!(
        set.states(),
        vec![
            ("a".to_string(), ConsumerState::Unsubscribed),
            ("b".to_string(), ConsumerState::Failed),
            ("c".to_string(), ConsumerState::Created),
        ]
    );
    assert_eq!(*journal.lock(), vec!["a:subscribed", "b:subscribed", "a:unsubscribed"]);
    assert!(service.subscribed_topics().is_empty());

    journal.lock().clear();
    let healthy = ConsumerSet::new()
        .with(Arc::new(RecordingConsumer::new("x", "orders", &journal)))
        .with(Arc::new(RecordingConsumer::new("y", "orders", &journal)));
    healthy.start_all(&service).await.expect("start all");
    assert_eq!(service.subscribed_topics(), vec!["orders".to_string()]);

    healthy.stop_all(&service).await;
    assert_eq!(
        *journal.lock(),
        vec!["x:subscribed", "y:subscribed", "y:unsubscribed", "x:unsubscribed"]
    );
    assert!(healthy.states().iter().all(|(_, state)| *state == ConsumerState::Unsubscribed));
}
