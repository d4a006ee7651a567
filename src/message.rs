// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! Transport-neutral message types: the [`Body`] handed to serializers, the
//! [`MessageProperties`] carried next to every payload, the [`DeliveryInfo`]
//! identifying one delivery, and the decoded [`Message`] envelope given to
//! consumers.

use crate::{context::ContextId, errors::AmqpError, serializer::Serializer};
use serde_json::Value;
use std::{collections::BTreeMap, fmt, sync::Arc};

/// A message body, either structured JSON or raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Json(Value),
    Bytes(Vec<u8>),
}

impl Body {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(value) => Some(value),
            Body::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Bytes(bytes) => Some(bytes),
            Body::Json(_) => None,
        }
    }

    /// Field lookup for JSON object bodies.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_json().and_then(|value| value.get(key))
    }
}

impl From<Value> for Body {
    fn from(value: Value) -> Self {
        Body::Json(value)
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::Bytes(bytes)
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Json(Value::String(text.to_owned()))
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Json(value) => write!(f, "{value}"),
            Body::Bytes(bytes) => write!(f, "{} bytes", bytes.len()),
        }
    }
}

/// Properties published with, and delivered alongside, a payload.
///
/// Every field is optional so property sets can be layered with
/// [`MessageProperties::merge`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub routing_key: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub persistent: Option<bool>,
    pub expiration: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub kind: Option<String>,
    pub app_id: Option<String>,
    pub priority: Option<u8>,
    pub headers: BTreeMap<String, Value>,
}

impl MessageProperties {
    pub fn new() -> MessageProperties {
        MessageProperties::default()
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn with_routing_key(mut self, key: impl Into<String>) -> Self {
        self.routing_key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = Some(persistent);
        self
    }

    pub fn with_expiration(mut self, expiration: impl Into<String>) -> Self {
        self.expiration = Some(expiration.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Layers `other` on top of `self`: fields set in `other` win, headers
    /// are combined with `other`'s keys taking precedence.
    pub fn merge(mut self, other: MessageProperties) -> MessageProperties {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }

        take!(
            routing_key,
            message_id,
            timestamp,
            content_type,
            content_encoding,
            persistent,
            expiration,
            correlation_id,
            reply_to,
            kind,
            app_id,
            priority
        );
        self.headers.extend(other.headers);
        self
    }
}

/// Identifies one delivery on one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryInfo {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub exchange: String,
    pub redelivered: bool,
    pub consumer_tag: String,
    /// Context owning the channel the delivery arrived on.
    pub context: ContextId,
    /// Which of that context's channels it arrived on; tags are only valid
    /// there.
    pub channel_generation: u64,
}

/// A decoded delivery as seen by a consumer.
#[derive(Debug, Clone)]
pub struct Message {
    delivery_info: DeliveryInfo,
    properties: MessageProperties,
    payload: Vec<u8>,
    body: Body,
}

impl Message {
    /// Decodes `payload` with `serializer`; malformed payloads fail here.
    pub fn new(
        delivery_info: DeliveryInfo,
        properties: MessageProperties,
        payload: Vec<u8>,
        serializer: &Arc<dyn Serializer>,
    ) -> Result<Message, AmqpError> {
        let body = serializer.decode(&payload)?;

        Ok(Message {
            delivery_info,
            properties,
            payload,
            body,
        })
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.body.get(key)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    pub fn delivery_info(&self) -> &DeliveryInfo {
        &self.delivery_info
    }

    pub fn message_id(&self) -> Option<&str> {
        self.properties.message_id.as_deref()
    }

    pub fn timestamp(&self) -> Option<u64> {
        self.properties.timestamp
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery_info.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.delivery_info.exchange
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#<Message body={}, message_id={:?}, timestamp={:?}, routing_key={:?}>",
            self.body,
            self.message_id(),
            self.timestamp(),
            self.routing_key()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::JsonSerializer;
    use serde_json::json;

    fn delivery_info() -> DeliveryInfo {
        DeliveryInfo {
            delivery_tag: 3,
            routing_key: "test.key".to_owned(),
            exchange: "burrow".to_owned(),
            redelivered: false,
            consumer_tag: "burrow-tag".to_owned(),
            context: ContextId::MAIN,
            channel_generation: 0,
        }
    }

    #[test]
    fn merge_prefers_the_right_hand_side() {
        let base = MessageProperties::new()
            .with_persistent(true)
            .with_message_id("a")
            .with_header("x", 1)
            .with_header("y", 1);
        let top = MessageProperties::new()
            .with_message_id("b")
            .with_header("y", 2);

        let merged = base.merge(top);

        assert_eq!(merged.persistent, Some(true));
        assert_eq!(merged.message_id.as_deref(), Some("b"));
        assert_eq!(merged.headers.get("x"), Some(&json!(1)));
        assert_eq!(merged.headers.get("y"), Some(&json!(2)));
    }

    #[test]
    fn message_exposes_delivery_and_property_fields() {
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        let message = Message::new(
            delivery_info(),
            MessageProperties::new()
                .with_message_id("m-1")
                .with_timestamp(42),
            br#"{"key":"value"}"#.to_vec(),
            &serializer,
        )
        .unwrap();

        assert_eq!(message.get("key"), Some(&json!("value")));
        assert_eq!(message.message_id(), Some("m-1"));
        assert_eq!(message.timestamp(), Some(42));
        assert_eq!(message.routing_key(), "test.key");
        assert_eq!(message.exchange(), "burrow");
        assert!(message.to_string().contains("routing_key=\"test.key\""));
    }

    #[test]
    fn decode_failures_surface_from_new() {
        let serializer: Arc<dyn Serializer> = Arc::new(JsonSerializer);
        let result = Message::new(
            delivery_info(),
            MessageProperties::new(),
            b"nope".to_vec(),
            &serializer,
        );
        assert!(result.is_err());
    }
}
