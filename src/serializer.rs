// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Body Serializers
//!
//! A serializer turns a [`Body`] into the bytes placed on the wire and back.
//! Consumers may pick their own serializer; everything else uses the process
//! default configured by id in [`BrokerConfig`](crate::config::BrokerConfig).

use crate::{errors::AmqpError, message::Body};
use std::{fmt::Debug, sync::Arc};

/// Content type advertised by the JSON serializer
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Encodes and decodes message bodies.
pub trait Serializer: Debug + Send + Sync {
    /// Identifier used to select the serializer from configuration.
    fn id(&self) -> &'static str;

    fn encode(&self, body: &Body) -> Result<Vec<u8>, AmqpError>;

    fn decode(&self, payload: &[u8]) -> Result<Body, AmqpError>;

    /// Value of the `content_type` property set on published messages.
    fn content_type(&self) -> Option<&'static str>;

    /// Whether payloads should be logged by size rather than content.
    fn binary(&self) -> bool;
}

/// JSON bodies, advertised as `application/json`.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn id(&self) -> &'static str {
        "json"
    }

    fn encode(&self, body: &Body) -> Result<Vec<u8>, AmqpError> {
        match body {
            Body::Json(value) => serde_json::to_vec(value)
                .map_err(|err| AmqpError::SerializationError(err.to_string())),
            Body::Bytes(bytes) => Ok(bytes.clone()),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Body, AmqpError> {
        serde_json::from_slice(payload)
            .map(Body::Json)
            .map_err(|err| AmqpError::SerializationError(err.to_string()))
    }

    fn content_type(&self) -> Option<&'static str> {
        Some(JSON_CONTENT_TYPE)
    }

    fn binary(&self) -> bool {
        false
    }
}

/// Passes payloads through untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentitySerializer;

impl Serializer for IdentitySerializer {
    fn id(&self) -> &'static str {
        "identity"
    }

    fn encode(&self, body: &Body) -> Result<Vec<u8>, AmqpError> {
        match body {
            Body::Bytes(bytes) => Ok(bytes.clone()),
            Body::Json(serde_json::Value::String(text)) => Ok(text.as_bytes().to_vec()),
            Body::Json(value) => Ok(value.to_string().into_bytes()),
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<Body, AmqpError> {
        Ok(Body::Bytes(payload.to_vec()))
    }

    fn content_type(&self) -> Option<&'static str> {
        None
    }

    fn binary(&self) -> bool {
        false
    }
}

/// Looks up a built-in serializer by its id.
pub fn by_id(id: &str) -> Option<Arc<dyn Serializer>> {
    match id {
        "json" => Some(Arc::new(JsonSerializer)),
        "identity" => Some(Arc::new(IdentitySerializer)),
        _ => None,
    }
}
