//! Message envelope and per-call options

pub mod message;
pub mod options;

pub use message::{validate_topic, Message, MessageAttributes, MessageMetadata};
pub use options::{
    DeliveryResilience, PublishOptions, SubscribeOptions, SubscriptionId, UnsubscribeOptions,
};
