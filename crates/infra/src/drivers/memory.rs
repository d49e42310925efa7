//! In-process driver
//!
//! Each subscribed topic owns a bounded queue drained by one worker task, so
//! messages on a topic reach the handler in publish order. Publishing to a
//! topic without a subscription drops the message, as a broadcast backend
//! would. A failed delivery is redelivered up to `max_redeliveries` times
//! before it is dropped.
//!
//! Delivery is at-least-once per topic subscription, not per handler. The
//! driver sees the single dispatching handler the service registers, so when
//! one service-level handler fails the whole message is redelivered and
//! handlers that already succeeded see it again.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use pubguard_core::{HandlerResult, MessageHandler, PubSubDriver, PubSubError, Result};
use pubguard_domain::{
    Message, MemoryOptions, PublishOptions, SubscribeOptions, UnsubscribeOptions, DRIVER_MEMORY,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

struct TopicWorker {
    sender: mpsc::Sender<Arc<Message>>,
    cancel: CancellationToken,
}

impl TopicWorker {
    /// Stop the worker without waiting for it; a handler may be the caller.
    fn shutdown(self) {
        self.cancel.cancel();
    }
}

/// Counters kept by [`InMemoryDriver`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryDriverStats {
    pub published: u64,
    /// Published to a topic nobody subscribed to
    pub dropped_unrouted: u64,
    pub delivered: u64,
    pub redelivered: u64,
    /// Gave up after the last redelivery
    pub dead_lettered: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    dropped_unrouted: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    dead_lettered: AtomicU64,
}

/// Driver that routes messages between publishers and subscribers of the
/// same process
///
/// Redelivery covers the message as a whole: a nack from any handler behind
/// the topic's subscription replays it to every handler, so handlers must be
/// idempotent when `max_redeliveries` is non-zero.
pub struct InMemoryDriver {
    options: MemoryOptions,
    connected: AtomicBool,
    topics: DashMap<String, TopicWorker>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for InMemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDriver")
            .field("options", &self.options)
            .field("connected", &self.connected.load(Ordering::Acquire))
            .field("topics", &self.topics.len())
            .finish()
    }
}

impl InMemoryDriver {
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            options,
            connected: AtomicBool::new(false),
            topics: DashMap::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn stats(&self) -> MemoryDriverStats {
        MemoryDriverStats {
            published: self.counters.published.load(Ordering::Relaxed),
            dropped_unrouted: self.counters.dropped_unrouted.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            redelivered: self.counters.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn ensure_connected(&self, operation: &'static str) -> Result<()> {
        if self.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PubSubError::NotConnected { operation })
        }
    }

    fn spawn_worker(&self, topic: &str, handler: MessageHandler) -> TopicWorker {
        let (sender, receiver) = mpsc::channel(self.options.buffer_size.max(1));
        let cancel = CancellationToken::new();
        let worker = Worker {
            topic: topic.to_string(),
            handler,
            max_redeliveries: self.options.max_redeliveries,
            counters: Arc::clone(&self.counters),
            cancel: cancel.clone(),
        };
        tokio::spawn(worker.run(receiver));
        TopicWorker { sender, cancel }
    }
}

impl Default for InMemoryDriver {
    fn default() -> Self {
        Self::new(MemoryOptions::default())
    }
}

#[async_trait]
impl PubSubDriver for InMemoryDriver {
    fn name(&self) -> &str {
        DRIVER_MEMORY
    }

    async fn connect(&self) -> Result<()> {
        self.connected.store(true, Ordering::Release);
        debug!(buffer_size = self.options.buffer_size, "memory_driver_connected");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::Release);

        let topics: Vec<String> = self.topics.iter().map(|entry| entry.key().clone()).collect();
        for topic in &topics {
            if let Some((_, worker)) = self.topics.remove(topic) {
                worker.shutdown();
            }
        }
        debug!(stopped_workers = topics.len(), "memory_driver_disconnected");
    }

    async fn publish(&self, message: &Message, _options: &PublishOptions) -> Result<()> {
        self.ensure_connected("publish")?;

        // Clone the sender so no map guard is held across the await.
        let sender = self.topics.get(&message.topic).map(|worker| worker.sender.clone());
        let Some(sender) = sender else {
            self.counters.dropped_unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %message.topic, message_id = %message.id, "memory_message_unrouted");
            return Ok(());
        };

        sender.send(Arc::new(message.clone())).await.map_err(|_| {
            PubSubError::transient(DRIVER_MEMORY, format!("topic '{}' was closed", message.topic))
        })?;
        self.counters.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        _options: &SubscribeOptions,
    ) -> Result<()> {
        self.ensure_connected("subscribe")?;

        let worker = self.spawn_worker(topic, handler);
        if let Some(previous) = self.topics.insert(topic.to_string(), worker) {
            warn!(topic, "memory_subscription_replaced");
            previous.shutdown();
        }
        info!(topic, "memory_subscription_started");
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, _options: &UnsubscribeOptions) -> Result<()> {
        if let Some((_, worker)) = self.topics.remove(topic) {
            worker.shutdown();
            info!(topic, "memory_subscription_stopped");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn subscribed_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|entry| entry.key().clone()).collect();
        topics.sort();
        topics
    }
}

struct Worker {
    topic: String,
    handler: MessageHandler,
    max_redeliveries: u32,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut receiver: mpsc::Receiver<Arc<Message>>) {
        loop {
            let message = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = receiver.recv() => match next {
                    Some(message) => message,
                    None => break,
                },
            };
            self.deliver(message).await;
        }
        debug!(topic = %self.topic, "memory_worker_stopped");
    }

    async fn deliver(&self, message: Arc<Message>) {
        let mut delivery = 0u32;
        loop {
            delivery += 1;
            let outcome = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return,
                outcome = self.invoke(Arc::clone(&message)) => outcome,
            };

            match outcome {
                Ok(()) => {
                    self.counters.delivered.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(err) if delivery <= self.max_redeliveries => {
                    self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        topic = %self.topic,
                        message_id = %message.id,
                        delivery,
                        error = %err,
                        "memory_message_nacked"
                    );
                }
                Err(err) => {
                    self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    error!(
                        topic = %self.topic,
                        message_id = %message.id,
                        deliveries = delivery,
                        error = %err,
                        "memory_message_dropped"
                    );
                    return;
                }
            }
        }
    }

    async fn invoke(&self, message: Arc<Message>) -> HandlerResult {
        let handler = Arc::clone(&self.handler);
        match AssertUnwindSafe(async move { handler(message).await }).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => Err("handler panicked".into()),
        }
    }
}
