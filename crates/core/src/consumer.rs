//! Consumer lifecycle
//!
//! A [`Consumer`] owns its subscription explicitly: the composing
//! application builds a [`ConsumerSet`] at startup, starts it after the
//! service connects and stops it before the service disconnects.
//!
//! ```text
//! Created -> Subscribing -> Active -> Unsubscribed
//!                 \
//!                  `-> Failed
//! ```
//!
//! `on_subscribe` runs once after the backend subscription is live and
//! before any message reaches `handle`; messages that arrive in between wait
//! for it to finish. `on_unsubscribe` runs once during stop and its errors
//! (and panics) are logged, never returned.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use pubguard_common::error::BoxedError;
use pubguard_domain::{Message, SubscribeOptions, SubscriptionId, UnsubscribeOptions};
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::driver::{handler_fn, HandlerResult};
use crate::error::{PubSubError, Result};
use crate::service::PubSubService;

/// A topic consumer with setup and teardown hooks
#[async_trait]
pub trait Consumer: Send + Sync + 'static {
    /// Name used in logs and failure reports
    fn name(&self) -> &str;

    fn topic(&self) -> &str;

    fn subscribe_options(&self) -> SubscribeOptions {
        SubscribeOptions::default()
    }

    /// Runs once after the subscription is established. An error or panic aborts
    /// the subscription.
    async fn on_subscribe(&self) -> std::result::Result<(), BoxedError> {
        Ok(())
    }

    /// Handle one message. An error counts as a failed delivery but keeps
    /// the subscription alive.
    async fn handle(&self, message: Arc<Message>) -> HandlerResult;

    /// Runs once during stop. Errors are logged only.
    async fn on_unsubscribe(&self) -> std::result::Result<(), BoxedError> {
        Ok(())
    }
}

/// Lifecycle state of a [`ManagedConsumer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Subscribing,
    Active,
    Unsubscribed,
    Failed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Subscribing => "subscribing",
            Self::Active => "active",
            Self::Unsubscribed => "unsubscribed",
            Self::Failed => "failed",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    Pending,
    Open,
    Closed,
}

struct Lifecycle {
    state: ConsumerState,
    subscription: Option<SubscriptionId>,
}

/// Drives one [`Consumer`] through its lifecycle
pub struct ManagedConsumer {
    consumer: Arc<dyn Consumer>,
    lifecycle: Mutex<Lifecycle>,
    gate: watch::Sender<Gate>,
}

impl fmt::Debug for ManagedConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedConsumer")
            .field("name", &self.consumer.name())
            .field("topic", &self.consumer.topic())
            .field("state", &self.state())
            .finish()
    }
}

impl ManagedConsumer {
    pub fn new(consumer: Arc<dyn Consumer>) -> Self {
        let (gate, _) = watch::channel(Gate::Pending);
        Self {
            consumer,
            lifecycle: Mutex::new(Lifecycle { state: ConsumerState::Created, subscription: None }),
            gate,
        }
    }

    pub fn name(&self) -> &str {
        self.consumer.name()
    }

    pub fn state(&self) -> ConsumerState {
        self.lifecycle.lock().state
    }

    pub fn subscription(&self) -> Option<SubscriptionId> {
        self.lifecycle.lock().subscription
    }

    /// Subscribe and run `on_subscribe`
    ///
    /// # Errors
    /// - `InvalidOptions` when the consumer was already started
    /// - the subscribe error when the subscription cannot be established
    /// - `ConsumerSetup` when `on_subscribe` fails; the subscription is
    ///   removed again
    pub async fn start(&self, service: &PubSubService) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConsumerState::Created {
                return Err(PubSubError::InvalidOptions(format!(
                    "consumer '{}' cannot start from state {}",
                    self.name(),
                    lifecycle.state
                )));
            }
            lifecycle.state = ConsumerState::Subscribing;
        }

        let topic = self.consumer.topic().to_string();
        let mut options = self.consumer.subscribe_options();
        options.handler_name.get_or_insert_with(|| self.name().to_string());

        let consumer = Arc::clone(&self.consumer);
        let gate = self.gate.subscribe();
        let handler = handler_fn(move |message| {
            let consumer = Arc::clone(&consumer);
            let mut gate = gate.clone();
            async move {
                let ready = gate.wait_for(|state| *state != Gate::Pending).await.map(|s| *s);
                match ready {
                    Ok(Gate::Open) => consumer.handle(message).await,
                    _ => Err(format!("consumer '{}' is not active", consumer.name()).into()),
                }
            }
        });

        let id = match service.subscribe(&topic, handler, options).await {
            Ok(id) => id,
            Err(err) => {
                self.fail();
                error!(
                    consumer = %self.name(),
                    topic = %topic,
                    error = %err,
                    "consumer_subscribe_failed"
                );
                return Err(err);
            }
        };
        self.lifecycle.lock().subscription = Some(id);

        let setup = match AssertUnwindSafe(self.consumer.on_subscribe()).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err(BoxedError::from("on_subscribe panicked")),
        };
        if let Err(source) = setup {
            self.fail();
            if let Err(err) = service.unsubscribe(&topic, UnsubscribeOptions::subscription(id)).await
            {
                error!(
                    consumer = %self.name(),
                    topic = %topic,
                    error = %err,
                    "consumer_rollback_failed"
                );
            }
            error!(
                consumer = %self.name(),
                topic = %topic,
                error = %source,
                "consumer_setup_failed"
            );
            return Err(PubSubError::ConsumerSetup { consumer: self.name().to_string(), source });
        }

        self.lifecycle.lock().state = ConsumerState::Active;
        self.gate.send_replace(Gate::Open);
        info!(consumer = %self.name(), topic = %topic, subscription = %id, "consumer_started");
        Ok(())
    }

    /// Unsubscribe and run `on_unsubscribe`
    ///
    /// Only an active consumer is stopped; any other state is a no-op.
    pub async fn stop(&self, service: &PubSubService) {
        let subscription = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state != ConsumerState::Active {
                return;
            }
            lifecycle.state = ConsumerState::Unsubscribed;
            lifecycle.subscription.take()
        };
        self.gate.send_replace(Gate::Closed);

        let topic = self.consumer.topic();
        if let Some(id) = subscription {
            if let Err(err) = service.unsubscribe(topic, UnsubscribeOptions::subscription(id)).await
            {
                error!(consumer = %self.name(), topic, error = %err, "consumer_unsubscribe_failed");
            }
        }

        match AssertUnwindSafe(self.consumer.on_unsubscribe()).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(consumer = %self.name(), topic, error = %err, "on_unsubscribe_failed");
            }
            Err(_) => error!(consumer = %self.name(), topic, "on_unsubscribe_panicked"),
        }
        info!(consumer = %self.name(), topic, "consumer_stopped");
    }

    fn fail(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = ConsumerState::Failed;
        lifecycle.subscription = None;
        drop(lifecycle);
        self.gate.send_replace(Gate::Closed);
    }
}

/// Ordered collection of consumers started and stopped together
#[derive(Debug, Default)]
pub struct ConsumerSet {
    consumers: Vec<ManagedConsumer>,
}

impl ConsumerSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.add(consumer);
        self
    }

    pub fn add(&mut self, consumer: Arc<dyn Consumer>) {
        self.consumers.push(ManagedConsumer::new(consumer));
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }

    /// `(name, state)` for every consumer in registration order
    pub fn states(&self) -> Vec<(String, ConsumerState)> {
        self.consumers.iter().map(|c| (c.name().to_string(), c.state())).collect()
    }

    /// Start consumers in registration order
    ///
    /// On the first failure the consumers already started are stopped in
    /// reverse order and the error is returned.
    pub async fn start_all(&self, service: &PubSubService) -> Result<()> {
        for (index, consumer) in self.consumers.iter().enumerate() {
            if let Err(err) = consumer.start(service).await {
                warn!(
                    consumer = %consumer.name(),
                    started = index,
                    "consumer_set_start_failed_rolling_back"
                );
                for started in self.consumers[..index].iter().rev() {
                    started.stop(service).await;
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Stop every active consumer in reverse registration order
    pub async fn stop_all(&self, service: &PubSubService) {
        for consumer in self.consumers.iter().rev() {
            consumer.stop(service).await;
        }
    }
}
