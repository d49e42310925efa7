//! PubSub service orchestrator
//!
//! [`PubSubService`] is the public face of the crate. It owns one driver and
//! two independent guard sets:
//! - the publish guards wrap every `publish` call
//! - the delivery guards wrap every handler invocation
//!
//! so a misbehaving consumer never opens the publish circuit.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pubguard_domain::{
    validate_topic, DeliveryResilience, Message, PubSubConfig, PublishOptions, SubscribeOptions,
    SubscriptionId, UnsubscribeOptions,
};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};

use crate::delivery::{Dispatcher, HandlerEntry, ShutdownSignal, SubscriptionTable};
use crate::driver::{MessageHandler, PubSubDriver};
use crate::error::{PubSubError, Result};
use crate::guards::{GuardSet, GuardSnapshot};
use crate::registry::DriverRegistry;

/// Acknowledgement of a successful publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub message_id: String,
    pub topic: String,
    /// Driver calls made, including retried ones
    pub attempts: u32,
    pub published_at: DateTime<Utc>,
}

/// Guard state for both paths
#[derive(Debug, Clone)]
pub struct GuardStats {
    pub publish: GuardSnapshot,
    pub delivery: GuardSnapshot,
}

struct ServiceInner {
    driver: Arc<dyn PubSubDriver>,
    publish_guards: GuardSet,
    delivery_guards: GuardSet,
    subscriptions: Arc<SubscriptionTable>,
    shutdown: Arc<ShutdownSignal>,
    connected: AtomicBool,
    /// Serializes connect, disconnect and backend subscription changes
    lifecycle: Mutex<()>,
    default_timeout: Option<Duration>,
}

/// Rolls back a first-handler subscription whose future was dropped while
/// the backend call was in flight
struct PendingSubscription<'a> {
    inner: &'a Arc<ServiceInner>,
    topic: &'a str,
    id: SubscriptionId,
    armed: bool,
}

impl<'a> PendingSubscription<'a> {
    fn new(inner: &'a Arc<ServiceInner>, topic: &'a str, id: SubscriptionId) -> Self {
        Self { inner, topic, id, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSubscription<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let removal = self.inner.subscriptions.remove(self.topic, Some(self.id));
        warn!(topic = self.topic, subscription = %self.id, "subscribe_cancelled");
        if !removal.topic_empty {
            return;
        }

        // The backend may complete the abandoned call; tear it down once the
        // lifecycle lock is free, unless a new handler claimed the topic.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let inner = Arc::clone(self.inner);
        let topic = self.topic.to_string();
        runtime.spawn(async move {
            let _lifecycle = inner.lifecycle.lock().await;
            if inner.subscriptions.handler_count(&topic) > 0
                || !inner.connected.load(Ordering::Acquire)
            {
                return;
            }
            if let Err(err) = inner.driver.unsubscribe(&topic, &UnsubscribeOptions::all()).await {
                error!(topic = %topic, error = %err, "subscribe_rollback_failed");
            }
        });
    }
}

/// Resilient publish/subscribe facade over a single driver
///
/// Cheap to clone; clones share the driver, guards and subscriptions.
#[derive(Clone)]
pub struct PubSubService {
    inner: Arc<ServiceInner>,
}

impl std::fmt::Debug for PubSubService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubService")
            .field("driver", &self.inner.driver.name())
            .field("connected", &self.is_connected())
            .field("topics", &self.subscribed_topics())
            .finish_non_exhaustive()
    }
}

impl PubSubService {
    /// Build a service around `driver`, using `config.resilience` for both
    /// the publish and delivery guards.
    pub fn new(driver: Arc<dyn PubSubDriver>, config: &PubSubConfig) -> Result<Self> {
        let publish = GuardSet::from_settings("publish", &config.resilience)?;
        let delivery = GuardSet::from_settings("delivery", &config.resilience)?;
        Ok(Self::with_guards(
            driver,
            publish,
            delivery,
            config.default_timeout_ms.map(Duration::from_millis),
        ))
    }

    /// Create the configured driver from `registry` and wrap it
    pub fn from_registry(registry: &DriverRegistry, config: &PubSubConfig) -> Result<Self> {
        let driver = registry.create_driver(config)?;
        Self::new(driver, config)
    }

    /// Build a service from explicitly assembled guard sets
    pub fn with_guards(
        driver: Arc<dyn PubSubDriver>,
        publish_guards: GuardSet,
        delivery_guards: GuardSet,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                driver,
                publish_guards,
                delivery_guards,
                subscriptions: Arc::new(SubscriptionTable::default()),
                shutdown: Arc::new(ShutdownSignal::default()),
                connected: AtomicBool::new(false),
                lifecycle: Mutex::new(()),
                default_timeout,
            }),
        }
    }

    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    /// Connect the driver. Calling it while connected is a no-op.
    #[instrument(skip(self), fields(driver = %self.driver_name()))]
    pub async fn connect(&self) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if self.inner.connected.load(Ordering::Acquire) {
            debug!("already_connected");
            return Ok(());
        }

        self.with_deadline(None, self.inner.driver.connect()).await?;

        self.inner.shutdown.renew();
        self.inner.publish_guards.resume();
        self.inner.delivery_guards.resume();
        self.inner.connected.store(true, Ordering::Release);
        info!("pubsub_connected");
        Ok(())
    }

    /// Disconnect the driver and halt every guard
    ///
    /// Waiting callers are cancelled, queued backpressure waiters rejected,
    /// and breakers and limiters reset. Backend subscriptions are torn down
    /// with the driver. Never fails; calling it while disconnected is a
    /// no-op.
    #[instrument(skip(self), fields(driver = %self.driver_name()))]
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        if !self.inner.connected.swap(false, Ordering::AcqRel) {
            debug!("already_disconnected");
            return;
        }

        self.inner.shutdown.cancel();
        self.inner.publish_guards.halt();
        self.inner.delivery_guards.halt();
        let dropped = self.inner.subscriptions.clear();

        self.inner.driver.disconnect().await;
        info!(dropped_handlers = dropped, "pubsub_disconnected");
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire) && self.inner.driver.is_connected()
    }

    /// Topics with at least one registered handler, sorted
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.inner.subscriptions.topics()
    }

    pub fn guard_stats(&self) -> GuardStats {
        GuardStats {
            publish: self.inner.publish_guards.snapshot(),
            delivery: self.inner.delivery_guards.snapshot(),
        }
    }

    /// Publish `data` to `topic` through the publish guards
    ///
    /// # Errors
    /// - `NotConnected` before [`connect`](Self::connect)
    /// - `InvalidOptions` for an empty topic
    /// - `RateLimited`, `CircuitOpen`, `BackpressureRejected`, `Timeout`,
    ///   `Cancelled` from the guards
    /// - `RetriesExhausted` or the terminal driver error
    #[instrument(skip(self, data, options), fields(driver = %self.driver_name()))]
    pub async fn publish(
        &self,
        topic: &str,
        data: Value,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        self.ensure_connected("publish")?;
        validate_topic(topic)?;

        let mut message = Message::new(topic, data);
        if let Some(metadata) = options.metadata.clone() {
            message = message.with_metadata(metadata);
        }
        if let Some(attributes) = options.attributes.clone() {
            message = message.with_attributes(attributes);
        }

        let cancel = self.inner.shutdown.child();
        let guarded = self.inner.publish_guards.run(DeliveryResilience::default(), &cancel, || {
            self.inner.driver.publish(&message, &options)
        });

        match self.with_deadline(options.timeout, guarded).await {
            Ok(attempted) => {
                debug!(
                    topic,
                    message_id = %message.id,
                    attempts = attempted.attempts,
                    "message_published"
                );
                Ok(PublishReceipt {
                    message_id: message.id,
                    topic: message.topic,
                    attempts: attempted.attempts,
                    published_at: message.timestamp,
                })
            }
            Err(err) => {
                warn!(topic, kind = err.kind(), error = %err, "publish_failed");
                Err(err)
            }
        }
    }

    /// Serialize `payload` and publish it
    pub async fn publish_json<T: Serialize + Sync>(
        &self,
        topic: &str,
        payload: &T,
        options: PublishOptions,
    ) -> Result<PublishReceipt> {
        let data = serde_json::to_value(payload)?;
        self.publish(topic, data, options).await
    }

    /// Register `handler` for `topic`
    ///
    /// The first handler for a topic establishes the backend subscription.
    /// Every invocation runs through the delivery guards selected in
    /// `options.resilience`.
    #[instrument(skip(self, handler, options), fields(driver = %self.driver_name()))]
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId> {
        validate_topic(topic)?;
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.ensure_connected("subscribe")?;

        let id = SubscriptionId::new();
        let name = options.handler_name.clone().unwrap_or_else(|| format!("{topic}/{id}"));
        let entry =
            HandlerEntry { id, name: name.clone(), handler, resilience: options.resilience };

        if self.inner.subscriptions.insert(topic, entry) {
            let mut pending = PendingSubscription::new(&self.inner, topic, id);
            let dispatcher = Dispatcher::new(
                topic,
                Arc::clone(&self.inner.subscriptions),
                self.inner.delivery_guards.clone(),
                Arc::clone(&self.inner.shutdown),
            )
            .into_handler();

            let established = self
                .with_deadline(
                    options.timeout,
                    self.inner.driver.subscribe(topic, dispatcher, &options),
                )
                .await;
            pending.disarm();
            if let Err(err) = established {
                self.inner.subscriptions.remove(topic, Some(id));
                if matches!(err, PubSubError::Timeout { .. }) {
                    // The backend may have finished after the deadline.
                    if let Err(cleanup) =
                        self.inner.driver.unsubscribe(topic, &UnsubscribeOptions::all()).await
                    {
                        error!(topic, error = %cleanup, "subscribe_rollback_failed");
                    }
                }
                warn!(topic, kind = err.kind(), error = %err, "subscribe_failed");
                return Err(err);
            }
        }

        info!(topic, subscription = %id, handler = %name, "handler_subscribed");
        Ok(id)
    }

    /// Remove one handler (`options.subscription`) or every handler on
    /// `topic`
    ///
    /// Removing the last handler tears down the backend subscription.
    /// Unknown topics and ids are a no-op.
    #[instrument(skip(self, options), fields(driver = %self.driver_name()))]
    pub async fn unsubscribe(&self, topic: &str, options: UnsubscribeOptions) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;

        let removal = self.inner.subscriptions.remove(topic, options.subscription);
        if removal.removed == 0 {
            debug!(topic, "unsubscribe_noop");
            return Ok(());
        }

        if removal.topic_empty && self.inner.connected.load(Ordering::Acquire) {
            self.with_deadline(options.timeout, self.inner.driver.unsubscribe(topic, &options))
                .await?;
        }

        info!(
            topic,
            removed = removal.removed,
            topic_closed = removal.topic_empty,
            "handlers_unsubscribed"
        );
        Ok(())
    }

    fn ensure_connected(&self, operation: &'static str) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(PubSubError::NotConnected { operation })
        }
    }

    async fn with_deadline<T>(
        &self,
        timeout: Option<Duration>,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout.or(self.inner.default_timeout) {
            Some(limit) => match tokio::time::timeout(limit, operation).await {
                Ok(result) => result,
                Err(_) => Err(PubSubError::Timeout { timeout: limit }),
            },
            None => operation.await,
        }
    }
}
