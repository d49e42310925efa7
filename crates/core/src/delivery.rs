//! Subscription table and message fan-out
//!
//! The service registers one dispatching handler per topic with the driver.
//! The dispatcher snapshots the topic's handlers, runs each through the
//! delivery guards concurrently and aggregates the failures. A failing or
//! panicking handler never stops delivery to its siblings.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::join_all;
use futures::FutureExt;
use parking_lot::RwLock;
use pubguard_domain::{DeliveryResilience, Message, SubscriptionId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::driver::{HandlerResult, MessageHandler};
use crate::error::{PubSubError, Result};
use crate::guards::GuardSet;

/// A single handler failure inside a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    pub subscription: SubscriptionId,
    pub handler: String,
    /// [`PubSubError::kind`] of the final error
    pub kind: &'static str,
    pub error: String,
}

/// Outcome of delivering one message to every handler of its topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub message_id: String,
    pub topic: String,
    /// Handlers the message was offered to
    pub handlers: usize,
    pub failures: Vec<HandlerFailure>,
}

impl DeliveryReport {
    pub fn delivered(&self) -> usize {
        self.handlers - self.failures.len()
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Cancellation root shared by every in-flight call; replaced on reconnect
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    token: RwLock<CancellationToken>,
}

impl ShutdownSignal {
    pub(crate) fn child(&self) -> CancellationToken {
        self.token.read().child_token()
    }

    pub(crate) fn cancel(&self) {
        self.token.read().cancel();
    }

    pub(crate) fn renew(&self) {
        let mut token = self.token.write();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

pub(crate) struct HandlerEntry {
    pub(crate) id: SubscriptionId,
    pub(crate) name: String,
    pub(crate) handler: MessageHandler,
    pub(crate) resilience: DeliveryResilience,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Removal {
    pub(crate) removed: usize,
    pub(crate) topic_empty: bool,
}

/// Topic to handler-set map
///
/// Delivery works on a cloned snapshot of the handler list, so subscribe and
/// unsubscribe never race with an in-progress fan-out.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    topics: RwLock<HashMap<String, Vec<Arc<HandlerEntry>>>>,
}

impl SubscriptionTable {
    /// Returns `true` when this is the first handler for `topic`
    pub(crate) fn insert(&self, topic: &str, entry: HandlerEntry) -> bool {
        let mut topics = self.topics.write();
        let handlers = topics.entry(topic.to_string()).or_default();
        handlers.push(Arc::new(entry));
        handlers.len() == 1
    }

    /// Remove one handler, or all of them when `id` is `None`
    pub(crate) fn remove(&self, topic: &str, id: Option<SubscriptionId>) -> Removal {
        let mut topics = self.topics.write();
        let Some(handlers) = topics.get_mut(topic) else {
            return Removal { removed: 0, topic_empty: true };
        };

        let before = handlers.len();
        match id {
            Some(id) => handlers.retain(|entry| entry.id != id),
            None => handlers.clear(),
        }
        let removed = before - handlers.len();
        let topic_empty = handlers.is_empty();
        if topic_empty {
            topics.remove(topic);
        }
        Removal { removed, topic_empty }
    }

    pub(crate) fn handlers(&self, topic: &str) -> Vec<Arc<HandlerEntry>> {
        self.topics.read().get(topic).cloned().unwrap_or_default()
    }

    pub(crate) fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.read().keys().cloned().collect();
        topics.sort();
        topics
    }

    pub(crate) fn handler_count(&self, topic: &str) -> usize {
        self.topics.read().get(topic).map_or(0, Vec::len)
    }

    /// Drop every entry, returning how many handlers were registered
    pub(crate) fn clear(&self) -> usize {
        let mut topics = self.topics.write();
        let count = topics.values().map(Vec::len).sum();
        topics.clear();
        count
    }
}

/// Fans a topic's messages out to its registered handlers
pub(crate) struct Dispatcher {
    topic: String,
    table: Arc<SubscriptionTable>,
    guards: GuardSet,
    shutdown: Arc<ShutdownSignal>,
}

impl Dispatcher {
    pub(crate) fn new(
        topic: &str,
        table: Arc<SubscriptionTable>,
        guards: GuardSet,
        shutdown: Arc<ShutdownSignal>,
    ) -> Self {
        Self { topic: topic.to_string(), table, guards, shutdown }
    }

    /// Package the dispatcher as the single handler given to the driver
    pub(crate) fn into_handler(self) -> MessageHandler {
        let dispatcher = Arc::new(self);
        Arc::new(move |message| {
            let dispatcher = Arc::clone(&dispatcher);
            Box::pin(async move { dispatcher.dispatch(message).await })
        })
    }

    async fn dispatch(&self, message: Arc<Message>) -> HandlerResult {
        let report = self.deliver(message).await;
        if report.is_success() {
            Ok(())
        } else {
            Err(Box::new(PubSubError::HandlerFailures(report)))
        }
    }

    pub(crate) async fn deliver(&self, message: Arc<Message>) -> DeliveryReport {
        let handlers = self.table.handlers(&self.topic);
        let cancel = self.shutdown.child();

        let outcomes =
            join_all(handlers.iter().map(|entry| self.invoke(entry, &message, &cancel))).await;

        let failures: Vec<HandlerFailure> = handlers
            .iter()
            .zip(outcomes)
            .filter_map(|(entry, outcome)| {
                let err = outcome.err()?;
                warn!(
                    topic = %self.topic,
                    message_id = %message.id,
                    handler = %entry.name,
                    kind = err.kind(),
                    error = %err,
                    "handler_failed"
                );
                Some(HandlerFailure {
                    subscription: entry.id,
                    handler: entry.name.clone(),
                    kind: err.kind(),
                    error: err.to_string(),
                })
            })
            .collect();

        debug!(
            topic = %self.topic,
            message_id = %message.id,
            handlers = handlers.len(),
            failed = failures.len(),
            "message_dispatched"
        );

        DeliveryReport {
            message_id: message.id.clone(),
            topic: self.topic.clone(),
            handlers: handlers.len(),
            failures,
        }
    }

    async fn invoke(
        &self,
        entry: &HandlerEntry,
        message: &Arc<Message>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.guards
            .run(entry.resilience, cancel, || {
                let handler = Arc::clone(&entry.handler);
                let message = Arc::clone(message);
                let name = entry.name.clone();
                async move {
                    // The handler itself runs inside the unwind guard, so a
                    // panic before its future is built is caught too.
                    let call = AssertUnwindSafe(async move { handler(message).await });
                    match call.catch_unwind().await {
                        Ok(Ok(())) => Ok(()),
                        Ok(Err(source)) => Err(PubSubError::HandlerFailure { handler: name, source }),
                        Err(_) => Err(PubSubError::HandlerFailure {
                            handler: name,
                            source: "handler panicked".into(),
                        }),
                    }
                }
            })
            .await
            .map(|_| ())
    }
}
