//! Driver port
//!
//! Backend adapters implement [`PubSubDriver`]. The service owns exactly one
//! connected driver and registers a single dispatching handler per topic, so
//! a driver only ever sees one handler per subscription.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use pubguard_common::error::BoxedError;
use pubguard_domain::{Message, PublishOptions, SubscribeOptions, UnsubscribeOptions};

use crate::error::Result;

/// Outcome of a handler invocation. An error marks the delivery as failed
/// (a nack for backends with acknowledgement semantics).
pub type HandlerResult = std::result::Result<(), BoxedError>;

/// Callback invoked for every message delivered on a topic
pub type MessageHandler = Arc<dyn Fn(Arc<Message>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Wrap an async closure as a [`MessageHandler`]
///
/// ```ignore
/// let handler = handler_fn(|message| async move {
///     println!("got {}", message.id);
///     Ok(())
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> MessageHandler
where
    F: Fn(Arc<Message>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// Backend-agnostic publish/subscribe contract
///
/// Implementations must be safe to call concurrently. `connect` and
/// `disconnect` are called by the service at most once per transition;
/// `disconnect` tears down every backend subscription.
#[async_trait]
pub trait PubSubDriver: Send + Sync {
    /// Registered identifier of this driver (`memory`, `kafka`, ...)
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Release backend resources. Never fails; problems are logged.
    async fn disconnect(&self);

    /// Hand a fully built envelope to the backend
    async fn publish(&self, message: &Message, options: &PublishOptions) -> Result<()>;

    /// Establish the backend subscription for `topic`
    ///
    /// Returns once the subscription is live; messages may be delivered to
    /// `handler` immediately after.
    async fn subscribe(
        &self,
        topic: &str,
        handler: MessageHandler,
        options: &SubscribeOptions,
    ) -> Result<()>;

    /// Tear down the backend subscription for `topic`
    async fn unsubscribe(&self, topic: &str, options: &UnsubscribeOptions) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn subscribed_topics(&self) -> Vec<String>;
}
