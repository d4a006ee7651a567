// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management
//!
//! This module provides types for defining exchanges and a handle for
//! publishing to an exchange once it has been declared on a channel.

use crate::{
    errors::AmqpError,
    message::MessageProperties,
    transport::{TransportChannel, TransportError},
};
use serde::Deserialize;
use serde_json::Value;
use std::{collections::BTreeMap, fmt, str::FromStr, sync::Arc};

/// Represents the types of exchanges available in RabbitMQ.
///
/// Each exchange type has specific routing behavior:
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl FromStr for ExchangeKind {
    type Err = AmqpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(ExchangeKind::Direct),
            "fanout" => Ok(ExchangeKind::Fanout),
            "topic" => Ok(ExchangeKind::Topic),
            "headers" => Ok(ExchangeKind::Headers),
            other => Err(AmqpError::ConfigError(format!(
                "unknown exchange type `{other}`"
            ))),
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exchange to declare. Builders start from a non-durable topic exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) durable: bool,
    pub(crate) params: BTreeMap<String, Value>,
}

impl ExchangeDefinition {
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Topic,
            durable: false,
            params: BTreeMap::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exchange_kind(&self) -> &ExchangeKind {
        &self.kind
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    /// Declaration arguments, e.g. `alternate-exchange`.
    pub fn params(mut self, params: BTreeMap<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Survives broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }
}

/// An exchange declared on a specific channel.
///
/// Handles are invalidated together with the channel they were declared on;
/// the channel broker hands out fresh ones after a reconnect.
#[derive(Clone)]
pub struct ExchangeHandle {
    name: String,
    channel: Arc<dyn TransportChannel>,
}

impl ExchangeHandle {
    pub(crate) fn new(name: &str, channel: Arc<dyn TransportChannel>) -> ExchangeHandle {
        ExchangeHandle {
            name: name.to_owned(),
            channel,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn channel(&self) -> &Arc<dyn TransportChannel> {
        &self.channel
    }

    pub(crate) async fn publish(
        &self,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        self.channel
            .publish(&self.name, routing_key, payload, properties)
            .await
    }
}

impl fmt::Debug for ExchangeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExchangeHandle")
            .field("name", &self.name)
            .field("active", &self.channel.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_case_insensitively() {
        assert_eq!("Topic".parse::<ExchangeKind>().unwrap(), ExchangeKind::Topic);
        assert_eq!(
            "fanout".parse::<ExchangeKind>().unwrap(),
            ExchangeKind::Fanout
        );
        assert!("x-delayed".parse::<ExchangeKind>().is_err());
    }

    #[test]
    fn builder_sets_flags() {
        let def = ExchangeDefinition::new("wait").fanout().durable();
        assert_eq!(def.name(), "wait");
        assert_eq!(def.exchange_kind(), &ExchangeKind::Fanout);
        assert!(def.is_durable());
        assert!(def.params.is_empty());
    }
}
