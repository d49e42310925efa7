//! Message envelope
//!
//! A [`Message`] is created by the publisher at call time and handed to
//! handlers behind an `Arc`, so it is never mutated once published. The serde
//! representation is the wire shape used by drivers that serialize:
//!
//! ```json
//! { "id": "…", "topic": "orders", "data": {…}, "timestamp": "2024-01-01T00:00:00Z",
//!   "metadata": {…}, "attributes": {…} }
//! ```
//!
//! `metadata` and `attributes` are omitted when absent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::errors::{DomainError, Result};

/// Free-form caller metadata carried with a message
pub type MessageMetadata = HashMap<String, Value>;

/// Backend-specific string attributes (headers, cloud queue attributes)
pub type MessageAttributes = HashMap<String, String>;

/// Immutable message envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub topic: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MessageMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<MessageAttributes>,
}

impl Message {
    /// Create an envelope with a fresh v4 id and the current timestamp
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            topic: topic.into(),
            data,
            timestamp: Utc::now(),
            metadata: None,
            attributes: None,
        }
    }

    /// Create an envelope from any serializable payload
    pub fn from_payload<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self> {
        Ok(Self::new(topic, serde_json::to_value(payload)?))
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: MessageMetadata) -> Self {
        self.metadata = if metadata.is_empty() { None } else { Some(metadata) };
        self
    }

    #[must_use]
    pub fn with_attributes(mut self, attributes: MessageAttributes) -> Self {
        self.attributes = if attributes.is_empty() { None } else { Some(attributes) };
        self
    }

    /// Decode the payload into a concrete type
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(DomainError::from)
    }

    /// Look up a single attribute
    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.as_ref().and_then(|attrs| attrs.get(key)).map(String::as_str)
    }

    /// Serialize to the JSON wire shape
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(DomainError::from)
    }

    /// Parse the JSON wire shape
    pub fn from_json(raw: &str) -> Result<Self> {
        let message: Self = serde_json::from_str(raw)?;
        validate_topic(&message.topic)?;
        Ok(message)
    }
}

/// Topics must be non-empty and free of surrounding whitespace.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(DomainError::InvalidTopic("topic must not be empty".into()));
    }
    if topic.trim() != topic {
        return Err(DomainError::InvalidTopic(format!(
            "topic '{topic}' has leading or trailing whitespace"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderCreated {
        order_id: u64,
        total_cents: i64,
    }

    #[test]
    fn test_new_message_has_unique_ids() {
        let a = Message::new("orders", json!({}));
        let b = Message::new("orders", json!({}));
        assert_ne!(a.id, b.id);
        assert!(Uuid::parse_str(&a.id).is_ok());
    }

    #[test]
    fn test_typed_payload() {
        let order = OrderCreated { order_id: 7, total_cents: 1250 };
        let message = Message::from_payload("orders.created", &order).unwrap();
        assert_eq!(message.payload::<OrderCreated>().unwrap(), order);
        assert!(message.payload::<Vec<String>>().is_err());
    }

    #[test]
    fn test_wire_shape_omits_absent_maps() {
        let message = Message::new("orders", json!({"a": 1}));
        let wire: Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        let object = wire.as_object().unwrap();
        assert!(object.contains_key("timestamp"));
        assert!(!object.contains_key("metadata"));
        assert!(!object.contains_key("attributes"));
        // ISO-8601 timestamp
        assert!(object["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_wire_shape_with_attributes() {
        let raw = r#"{
            "id": "abc",
            "topic": "billing",
            "data": [1, 2, 3],
            "timestamp": "2024-05-01T12:00:00Z",
            "attributes": { "tenant": "acme" }
        }"#;
        let message = Message::from_json(raw).unwrap();
        assert_eq!(message.attribute("tenant"), Some("acme"));
        assert_eq!(message.metadata, None);
    }

    #[test]
    fn test_empty_maps_are_dropped() {
        let message = Message::new("t", Value::Null)
            .with_metadata(MessageMetadata::new())
            .with_attributes(MessageAttributes::new());
        assert!(message.metadata.is_none());
        assert!(message.attributes.is_none());
    }

    #[test]
    fn test_validate_topic() {
        assert!(validate_topic("orders").is_ok());
        assert!(matches!(validate_topic(""), Err(DomainError::InvalidTopic(_))));
        assert!(matches!(validate_topic(" orders"), Err(DomainError::InvalidTopic(_))));
        let raw = r#"{"id":"1","topic":"","data":null,"timestamp":"2024-05-01T12:00:00Z"}"#;
        assert!(Message::from_json(raw).is_err());
    }
}
