// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publisher
//!
//! This module turns a body and caller-supplied properties into the payload
//! and final property set sent to RabbitMQ, and performs the publish on an
//! exchange handle.
//!
//! Properties are layered from lowest to highest precedence:
//! `{persistent: true}`, the caller's properties, the process-wide global
//! properties, and finally `routing_key`, `timestamp` and `content_type`,
//! which can never be overridden. The OpenTelemetry context of the caller is
//! propagated in the headers.

use crate::{
    errors::AmqpError,
    exchange::ExchangeHandle,
    message::{Body, MessageProperties},
    otel::TracePropagator,
    serializer::Serializer,
};
use opentelemetry::{global, Context};
use std::{
    fmt,
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{error, info};
use uuid::Uuid;

/// Properties applied to every publish of the process.
#[derive(Clone)]
pub enum GlobalProperties {
    Static(MessageProperties),
    /// Evaluated on every publish
    Dynamic(Arc<dyn Fn() -> MessageProperties + Send + Sync>),
}

impl GlobalProperties {
    pub fn resolve(&self) -> MessageProperties {
        match self {
            GlobalProperties::Static(props) => props.clone(),
            GlobalProperties::Dynamic(f) => f(),
        }
    }
}

impl fmt::Debug for GlobalProperties {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GlobalProperties::Static(props) => f.debug_tuple("Static").field(props).finish(),
            GlobalProperties::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Per-call publish options.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Overrides the process default serializer
    pub serializer: Option<Arc<dyn Serializer>>,
}

impl PublishOptions {
    pub fn with_serializer(serializer: Arc<dyn Serializer>) -> PublishOptions {
        PublishOptions {
            serializer: Some(serializer),
        }
    }
}

/// An encoded message ready to be handed to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Outgoing {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

/// Builds and sends outgoing messages.
#[derive(Debug)]
pub struct Publisher {
    serializer: Arc<dyn Serializer>,
    global: Option<GlobalProperties>,
    force_confirms: bool,
}

impl Publisher {
    /// Creates a new publisher.
    ///
    /// # Parameters
    /// * `serializer` - Serializer used when a publish does not name one
    /// * `global` - Process-wide properties, if any
    /// * `force_confirms` - Wait for the broker confirm after every publish
    pub fn new(
        serializer: Arc<dyn Serializer>,
        global: Option<GlobalProperties>,
        force_confirms: bool,
    ) -> Publisher {
        Publisher {
            serializer,
            global,
            force_confirms,
        }
    }

    /// Encodes `body` and resolves the final property set.
    pub fn build(
        &self,
        routing_key: &str,
        body: &Body,
        properties: MessageProperties,
        options: &PublishOptions,
    ) -> Result<Outgoing, AmqpError> {
        let serializer = options.serializer.as_ref().unwrap_or(&self.serializer);

        let mut properties = properties;
        if properties.message_id.is_none() {
            properties.message_id = Some(Uuid::new_v4().to_string());
        }

        let mut merged = MessageProperties::new().with_persistent(true).merge(properties);
        if let Some(global) = &self.global {
            merged = merged.merge(global.resolve());
        }

        merged.routing_key = Some(routing_key.to_owned());
        merged.timestamp = Some(now());
        merged.content_type = serializer.content_type().map(str::to_owned);

        global::get_text_map_propagator(|propagator| {
            propagator.inject_context(
                &Context::current(),
                &mut TracePropagator::new(&mut merged.headers),
            )
        });

        let payload = serializer.encode(body)?;

        if serializer.binary() {
            info!(routing_key, "publishing {} bytes message", payload.len());
        } else {
            info!(
                routing_key,
                "publishing message '{}'",
                String::from_utf8_lossy(&payload)
            );
        }

        Ok(Outgoing {
            routing_key: routing_key.to_owned(),
            payload,
            properties: merged,
        })
    }

    /// Publishes `outgoing` on `exchange`, waiting for the broker confirm
    /// when confirms are forced.
    pub async fn send(&self, exchange: &ExchangeHandle, outgoing: &Outgoing) -> Result<(), AmqpError> {
        if let Err(err) = exchange
            .publish(&outgoing.routing_key, &outgoing.payload, &outgoing.properties)
            .await
        {
            error!(
                error = err.to_string(),
                exchange = exchange.name(),
                "error publishing message"
            );
            return Err(AmqpError::PublishError(format!(
                "unable to publish - {}. Routing key: {}.",
                err, outgoing.routing_key
            )));
        }

        if self.force_confirms {
            exchange.channel().wait_for_confirms().await.map_err(|err| {
                error!(error = err.to_string(), "publish was not confirmed");
                AmqpError::PublishError(format!("unconfirmed publish: {err}"))
            })?;
        }

        Ok(())
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
