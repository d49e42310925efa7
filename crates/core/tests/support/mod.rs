//! Shared test helpers for `pubguard-core` integration tests.
//!
//! `MockDriver` records every call and lets tests script publish failures
//! and push messages into registered handlers the way a backend would.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use pubguard_core::{HandlerResult, MessageHandler, PubSubDriver, PubSubError, Result};
use pubguard_domain::{
    Message, PubSubConfig, PublishOptions, SubscribeOptions, UnsubscribeOptions,
};
use serde_json::Value;

#[derive(Default)]
pub struct MockDriver {
    connected: AtomicBool,
    script: Mutex<VecDeque<PubSubError>>,
    always_fail: AtomicBool,
    publish_delay: Mutex<Option<Duration>>,
    subscribe_delay: Mutex<Option<Duration>>,
    published: Mutex<Vec<Message>>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
    unsubscribed: Mutex<Vec<String>>,
    pub publish_calls: AtomicU32,
    pub subscribe_calls: AtomicU32,
    pub connect_calls: AtomicU32,
    pub disconnect_calls: AtomicU32,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` publishes with a transient driver error
    pub fn failing_publishes(n: usize) -> Arc<Self> {
        let driver = Self::default();
        driver
            .script
            .lock()
            .extend((0..n).map(|i| PubSubError::transient("mock", format!("failure {i}"))));
        Arc::new(driver)
    }

    pub fn always_failing() -> Arc<Self> {
        let driver = Self::default();
        driver.always_fail.store(true, Ordering::SeqCst);
        Arc::new(driver)
    }

    /// Queue a failure for an upcoming publish
    pub fn push_failure(&self, err: PubSubError) {
        self.script.lock().push_back(err);
    }

    pub fn set_publish_delay(&self, delay: Duration) {
        *self.publish_delay.lock() = Some(delay);
    }

    /// Stall the next `subscribe` call for `delay`
    pub fn delay_next_subscribe(&self, delay: Duration) {
        *self.subscribe_delay.lock() = Some(delay);
    }

    pub fn published(&self) -> Vec<Message> {
        self.published.lock().clone()
    }

    pub fn unsubscribed(&self) -> Vec<String> {
        self.unsubscribed.lock().clone()
    }

    pub fn has_backend_subscription(&self, topic: &str) -> bool {
        self.handlers.lock().contains_key(topic)
    }

    /// Deliver a message the way a backend consumer loop would
    pub async fn deliver(&self, topic: &str, data: Value) -> HandlerResult {
        let handler = self.handlers.lock().get(topic).cloned();
        match handler {
            Some(handler) => handler(Arc::new(Message::new(topic, data))).await,
            None => Err(format!("no backend subscription for {topic}").into()),
        }
    }
}

#[async_trait]
impl PubSubDriver for MockDriver {
    fn name(&self) -> &str {
        "mock"
    }

    async fn connect(&self) -> Result<()> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
        self.handlers.lock().clear();
    }

    async fn publish(&self, message: &Message, _options: &PublishOptions) -> Result<()> {
        self.publish_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.publish_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.always_fail.load(Ordering::SeqCst) {
            return Err(PubSubError::transient("mock", "backend unavailable"));
        }
        let scripted = self.script.lock().pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }
        self.published.lock().push(message.clone());
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        _options: &SubscribeOptions,
    ) -> Result<()> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.subscribe_delay.lock().take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.handlers.lock().insert(topic.to_string(), handler);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, _options: &UnsubscribeOptions) -> Result<()> {
        self.handlers.lock().remove(topic);
        self.unsubscribed.lock().push(topic.to_string());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribed_topics(&self) -> Vec<String> {
        self.handlers.lock().keys().cloned().collect()
    }
}

/// Config with fast retries: 3 attempts, 10 ms exponential backoff
pub fn fast_config() -> PubSubConfig {
    let mut config = PubSubConfig::for_driver("mock");
    config.resilience.retry.max_attempts = 3;
    config.resilience.retry.base_delay_ms = 10;
    config.resilience.retry.max_delay_ms = 100;
    config.resilience.circuit_breaker.failure_threshold = 5;
    config
}
