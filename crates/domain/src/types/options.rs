//! Per-call options for publish, subscribe and unsubscribe

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::{MessageAttributes, MessageMetadata};

/// Options for a single publish call
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Deadline for the whole call, guards included. Falls back to the
    /// service default when `None`.
    pub timeout: Option<Duration>,
    pub metadata: Option<MessageMetadata>,
    /// Backend-specific attributes (Kafka headers, cloud queue attributes)
    pub attributes: Option<MessageAttributes>,
    /// Partition / ordering key for backends that support one
    pub ordering_key: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    #[must_use]
    pub fn attributes(mut self, attributes: MessageAttributes) -> Self {
        self.attributes = Some(attributes);
        self
    }

    #[must_use]
    pub fn ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }
}

/// Which resilience guards wrap handler invocations for a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryResilience {
    pub retry: bool,
    pub circuit_breaker: bool,
    pub rate_limit: bool,
    pub backpressure: bool,
}

impl Default for DeliveryResilience {
    fn default() -> Self {
        Self { retry: true, circuit_breaker: true, rate_limit: true, backpressure: true }
    }
}

impl DeliveryResilience {
    /// Deliver straight to the handler with no guards
    pub const fn none() -> Self {
        Self { retry: false, circuit_breaker: false, rate_limit: false, backpressure: false }
    }
}

/// Options for registering a handler
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Deadline for establishing the backend subscription
    pub timeout: Option<Duration>,
    /// Name used for the handler in logs and failure reports
    pub handler_name: Option<String>,
    pub resilience: DeliveryResilience,
    /// Consumer group / subscription name for backends that need one
    pub group: Option<String>,
}

impl SubscribeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn handler_name(mut self, name: impl Into<String>) -> Self {
        self.handler_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn resilience(mut self, resilience: DeliveryResilience) -> Self {
        self.resilience = resilience;
        self
    }

    #[must_use]
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Options for removing handlers
#[derive(Debug, Clone, Default)]
pub struct UnsubscribeOptions {
    /// Remove only this handler. `None` removes every handler on the topic.
    pub subscription: Option<SubscriptionId>,
    pub timeout: Option<Duration>,
}

impl UnsubscribeOptions {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn subscription(id: SubscriptionId) -> Self {
        Self { subscription: Some(id), timeout: None }
    }
}

/// Identifier of a single registered handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
