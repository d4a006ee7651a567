// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # OpenTelemetry Integration for RabbitMQ
//!
//! This module provides integration with OpenTelemetry for distributed tracing.
//! It includes utilities for propagating trace context through RabbitMQ message headers,
//! extracting context from incoming messages, and a [`Tracer`] creating one
//! consumer span per processed message.

use crate::{
    consumer::ConsumerDescriptor, errors::HandlerError, message::Message, tracer::Tracer,
};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use opentelemetry::{
    global::{self, BoxedSpan, BoxedTracer},
    propagation::{Extractor, Injector},
    trace::{Span, SpanKind, Status, TraceContextExt, Tracer as _},
    Context, KeyValue,
};
use serde_json::Value;
use std::{
    borrow::Cow,
    collections::BTreeMap,
    future::Future,
    pin::Pin,
    task::{self, Poll},
};

/// An adapter for injecting OpenTelemetry context into message headers.
pub(crate) struct TracePropagator<'a> {
    headers: &'a mut BTreeMap<String, Value>,
}

impl<'a> TracePropagator<'a> {
    pub(crate) fn new(headers: &'a mut BTreeMap<String, Value>) -> Self {
        Self { headers }
    }
}

impl Injector for TracePropagator<'_> {
    /// Sets a trace context key-value pair in the message headers.
    fn set(&mut self, key: &str, value: String) {
        self.headers.insert(key.to_lowercase(), Value::String(value));
    }
}

/// Reads OpenTelemetry context back out of delivered headers.
pub(crate) struct HeaderExtractor<'a> {
    headers: &'a BTreeMap<String, Value>,
}

impl Extractor for HeaderExtractor<'_> {
    /// Gets a trace context value; only string headers can carry one.
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(Value::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(String::as_str).collect()
    }
}

/// Creates a new OpenTelemetry span for message processing.
///
/// # Parameters
/// * `headers` - Headers of the delivered message
/// * `tracer` - OpenTelemetry tracer
/// * `name` - Name for the new span (the consumer name)
///
/// # Returns
/// A tuple containing the extracted context and the new span
pub fn new_span(
    headers: &BTreeMap<String, Value>,
    tracer: &BoxedTracer,
    name: &str,
) -> (Context, BoxedSpan) {
    let ctx = global::get_text_map_propagator(|propagator| {
        propagator.extract(&HeaderExtractor { headers })
    });

    let span = tracer
        .span_builder(Cow::from(name.to_owned()))
        .with_kind(SpanKind::Consumer)
        .start_with_context(tracer, &ctx);

    (ctx, span)
}

/// Traces consumers with the globally installed OpenTelemetry tracer.
#[derive(Debug, Clone)]
pub struct OtelTracer {
    scope: &'static str,
}

impl OtelTracer {
    pub fn new(scope: &'static str) -> OtelTracer {
        OtelTracer { scope }
    }
}

impl Default for OtelTracer {
    fn default() -> Self {
        OtelTracer::new("amqp consumer")
    }
}

#[async_trait]
impl Tracer for OtelTracer {
    async fn trace(
        &self,
        descriptor: &ConsumerDescriptor,
        message: &Message,
        call: BoxFuture<'_, Result<(), HandlerError>>,
    ) -> Result<(), HandlerError> {
        let tracer = global::tracer(self.scope);
        let (parent, mut span) =
            new_span(&message.properties().headers, &tracer, descriptor.name());

        span.set_attribute(KeyValue::new(
            "messaging.rabbitmq.destination.routing_key",
            message.routing_key().to_owned(),
        ));
        span.set_attribute(KeyValue::new(
            "messaging.message.body.size",
            message.payload().len() as i64,
        ));
        if let Some(id) = message.message_id() {
            span.set_attribute(KeyValue::new("messaging.message.id", id.to_owned()));
        }

        let cx = parent.with_span(span);
        let result = InContext {
            cx: cx.clone(),
            inner: call,
        }
        .await;

        let span = cx.span();
        match &result {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                span.record_error(&**err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();

        result
    }
}

/// Polls `inner` with `cx` as the current context, so whatever the consumer
/// publishes continues the delivery's trace.
struct InContext<F> {
    cx: Context,
    inner: F,
}

impl<F> Future for InContext<F>
where
    F: Future + Unpin,
{
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, task: &mut task::Context<'_>) -> Poll<F::Output> {
        let this = self.get_mut();
        let _guard = this.cx.clone().attach();
        Pin::new(&mut this.inner).poll(task)
    }
}
