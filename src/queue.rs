// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! This module provides types for defining queues, the handle returned once a
//! queue has been declared, and the namespace rules applied to queue names.

use serde_json::Value;
use std::collections::BTreeMap;

/// Constant for the argument used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";

/// A queue to declare, with the arguments passed to `queue.declare`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) arguments: BTreeMap<String, Value>,
}

impl QueueDefinition {
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..QueueDefinition::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    pub fn queue_arguments(&self) -> &BTreeMap<String, Value> {
        &self.arguments
    }

    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Replaces the declaration arguments (`x-message-ttl`, `x-max-length`
    /// and the like).
    pub fn arguments(mut self, arguments: BTreeMap<String, Value>) -> Self {
        self.arguments = arguments;
        self
    }

    /// Dead-letters expired or rejected messages into `exchange`, keeping
    /// their original routing key.
    pub fn dead_letter_to(mut self, exchange: &str) -> Self {
        self.arguments.insert(
            AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(),
            Value::String(exchange.to_owned()),
        );
        self
    }
}

/// A queue that has been declared on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    name: String,
}

impl Queue {
    pub(crate) fn new(name: String) -> Queue {
        Queue { name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Removes every character outside `[A-Za-z0-9_:.-]` from a namespace.
pub fn sanitize_namespace(namespace: &str) -> String {
    namespace
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ':' | '.' | '-'))
        .collect()
}

/// Applies the broker-wide namespace to a queue name.
///
/// Returns `name` untouched when the sanitized namespace is empty.
pub fn namespaced(namespace: Option<&str>, name: &str) -> String {
    let namespace = namespace.map(sanitize_namespace).unwrap_or_default();

    if namespace.is_empty() {
        name.to_owned()
    } else {
        format!("{namespace}:{name}")
    }
}
