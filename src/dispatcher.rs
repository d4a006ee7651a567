// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Dispatcher
//!
//! Runs a consumer for each delivery of its subscription and settles the
//! delivery exactly once:
//!
//! 1. the payload is decoded with the consumer's serializer, or the broker's
//! 2. a fresh consumer instance processes it, wrapped by the tracer
//! 3. success acks; failure asks the acknowledgement strategies how to settle
//!    and then reports to every error handler
//!
//! Decode failures and panics take the failure path like any consumer error.

use crate::{
    acknowledgements::{AckDecision, Acknowledgement, AcknowledgementChain},
    broker::Broker,
    consumer::{ConsumerContext, ConsumerDescriptor},
    errors::{AmqpError, HandlerError},
    error_handlers::{ErrorHandler, ErrorHandlerChain},
    message::{DeliveryInfo, Message},
    tracer::{NullTracer, Tracer},
    transport::{Delivery, DeliveryStream},
};
use futures_util::{FutureExt, StreamExt};
use std::{any::Any, panic::AssertUnwindSafe, sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// How long the subscription loop waits for a delivery before it drains the
/// acknowledgements queued for its context.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Why [`MessageDispatcher::consume`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The work pool is stopping.
    Shutdown,
    /// The delivery stream ended under the loop, the channel or the consumer
    /// is gone.
    Cancelled,
}

pub struct MessageDispatcher {
    broker: Arc<Broker>,
    tracer: Arc<dyn Tracer>,
    acknowledgements: AcknowledgementChain,
    error_handlers: ErrorHandlerChain,
}

impl MessageDispatcher {
    /// A dispatcher without tracing, with only the nack fallback and the
    /// logging error handler.
    pub fn new(broker: Arc<Broker>) -> MessageDispatcher {
        MessageDispatcher {
            broker,
            tracer: Arc::new(NullTracer),
            acknowledgements: AcknowledgementChain::new(),
            error_handlers: ErrorHandlerChain::new(),
        }
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Appends a strategy; strategies are asked in the order they were added.
    pub fn with_acknowledgement(mut self, strategy: Arc<dyn Acknowledgement>) -> Self {
        self.acknowledgements.push(strategy);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handlers.push(handler);
        self
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn error_handlers(&self) -> &ErrorHandlerChain {
        &self.error_handlers
    }

    /// Handles one delivery and returns how it was settled.
    pub async fn call(&self, descriptor: &ConsumerDescriptor, delivery: Delivery) -> AckDecision {
        let Delivery {
            delivery_info,
            properties,
            payload,
        } = delivery;

        let serializer = descriptor
            .get_serializer()
            .unwrap_or_else(|| self.broker.serializer())
            .clone();

        debug!(
            message_id = properties.message_id.as_deref().unwrap_or("-"),
            routing_key = delivery_info.routing_key.as_str(),
            consumer = descriptor.name(),
            "{}",
            payload_summary(&payload, serializer.binary())
        );

        let ctx = ConsumerContext::new(self.broker.clone(), delivery_info.clone());

        let outcome = match Message::new(
            delivery_info.clone(),
            properties.clone(),
            payload.clone(),
            &serializer,
        ) {
            Ok(message) => self.invoke(descriptor, &ctx, &message).await,
            Err(err) => Err(Box::new(err) as HandlerError),
        };

        match outcome {
            Ok(()) => {
                if let Some(decision) = ctx.decision() {
                    return decision;
                }
                self.settle(&delivery_info, AckDecision::Ack).await;
                AckDecision::Ack
            }
            Err(err) => {
                let decision = match ctx.decision() {
                    Some(decision) => decision,
                    None => {
                        let decision = self
                            .acknowledgements
                            .resolve(&delivery_info, &properties, &self.broker, &err)
                            .await;
                        self.settle(&delivery_info, decision).await;
                        decision
                    }
                };

                self.error_handlers
                    .notify(&delivery_info, &properties, &payload, descriptor, &err)
                    .await;

                decision
            }
        }
    }

    async fn invoke(
        &self,
        descriptor: &ConsumerDescriptor,
        ctx: &ConsumerContext,
        message: &Message,
    ) -> Result<(), HandlerError> {
        let traced = async {
            let consumer = descriptor.instantiate();
            self.tracer
                .trace(descriptor, message, consumer.process(ctx, message))
                .await
        };

        AssertUnwindSafe(traced)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(Box::new(AmqpError::ConsumerPanic(panic_message(panic))) as HandlerError)
            })
    }

    async fn settle(&self, delivery_info: &DeliveryInfo, decision: AckDecision) {
        let result = match decision {
            AckDecision::Ack => self.broker.ack(delivery_info).await,
            AckDecision::Nack => self.broker.nack(delivery_info).await,
            AckDecision::Requeue => self.broker.requeue(delivery_info).await,
        };

        if let Err(err) = result {
            error!(
                error = err.to_string(),
                delivery_tag = delivery_info.delivery_tag,
                %decision,
                "failure to settle message"
            );
        }
    }

    /// Feeds `deliveries` to [`MessageDispatcher::call`] until the stream ends
    /// or `shutdown` flips, and tells which one happened. A delivery being
    /// handled when shutdown is requested is finished first.
    ///
    /// Must run inside the context owning the subscription's channel, which
    /// also drains the acknowledgements other contexts queued for it.
    pub async fn consume(
        &self,
        descriptor: &ConsumerDescriptor,
        mut deliveries: DeliveryStream,
        mut shutdown: watch::Receiver<bool>,
    ) -> SubscriptionEnd {
        let end = loop {
            if *shutdown.borrow() {
                break SubscriptionEnd::Shutdown;
            }

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break SubscriptionEnd::Shutdown;
                    }
                }

                next = tokio::time::timeout(POLL_INTERVAL, deliveries.next()) => match next {
                    Err(_) => {}
                    Ok(Some(Ok(delivery))) => {
                        self.call(descriptor, delivery).await;
                    }
                    Ok(Some(Err(err))) => {
                        error!(error = err.to_string(), consumer = descriptor.name(), "errors consume msg")
                    }
                    Ok(None) => {
                        info!(consumer = descriptor.name(), "subscription cancelled");
                        break SubscriptionEnd::Cancelled;
                    }
                },
            }

            self.broker.drain_pending_actions().await;
        };

        self.broker.drain_pending_actions().await;
        debug!(consumer = descriptor.name(), ?end, "subscription loop stopped");
        end
    }
}

fn payload_summary(payload: &[u8], binary: bool) -> String {
    if binary {
        format!("message({} bytes)", payload.len())
    } else {
        format!("message({})", String::from_utf8_lossy(payload))
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
