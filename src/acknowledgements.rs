// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgement Strategies
//!
//! When a consumer fails, the strategies of an [`AcknowledgementChain`] are
//! asked in order how to settle the delivery. The first one returning a
//! decision wins; if none does, [`NackOnAllFailures`] nacks without requeue.
//! Strategies only decide, the dispatcher issues the decision, so a delivery
//! is settled exactly once.

use crate::{
    broker::Broker,
    errors::{AmqpError, HandlerError},
    message::{DeliveryInfo, MessageProperties},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{error::Error, fmt, marker::PhantomData, panic::AssertUnwindSafe, sync::Arc};
use tracing::{debug, error};

/// How a delivery is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    /// Negative acknowledgement without requeue
    Nack,
    /// Back to the queue for redelivery
    Requeue,
}

impl fmt::Display for AckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckDecision::Ack => f.write_str("ack"),
            AckDecision::Nack => f.write_str("nack"),
            AckDecision::Requeue => f.write_str("requeue"),
        }
    }
}

#[async_trait]
pub trait Acknowledgement: Send + Sync {
    /// Returns the decision if this strategy handles `err`, `None` to pass
    /// to the next strategy. Errors count as `None`.
    async fn handle(
        &self,
        delivery_info: &DeliveryInfo,
        properties: &MessageProperties,
        broker: &Broker,
        err: &HandlerError,
    ) -> Result<Option<AckDecision>, AmqpError>;
}

/// Nacks every failure. Always last in the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct NackOnAllFailures;

#[async_trait]
impl Acknowledgement for NackOnAllFailures {
    async fn handle(
        &self,
        _delivery_info: &DeliveryInfo,
        properties: &MessageProperties,
        _broker: &Broker,
        _err: &HandlerError,
    ) -> Result<Option<AckDecision>, AmqpError> {
        debug!(
            message_id = properties.message_id.as_deref().unwrap_or("-"),
            "nacking message"
        );
        Ok(Some(AckDecision::Nack))
    }
}

/// Requeues deliveries whose consumer failed with an `E`.
pub struct RequeueOn<E> {
    _error: PhantomData<fn() -> E>,
}

impl<E> RequeueOn<E> {
    pub fn new() -> Self {
        RequeueOn {
            _error: PhantomData,
        }
    }
}

impl<E> Default for RequeueOn<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> Acknowledgement for RequeueOn<E>
where
    E: Error + 'static,
{
    async fn handle(
        &self,
        _delivery_info: &DeliveryInfo,
        properties: &MessageProperties,
        _broker: &Broker,
        err: &HandlerError,
    ) -> Result<Option<AckDecision>, AmqpError> {
        Ok(err.downcast_ref::<E>().map(|_| {
            debug!(
                message_id = properties.message_id.as_deref().unwrap_or("-"),
                "requeueing message"
            );
            AckDecision::Requeue
        }))
    }
}

/// Nacks, without requeue, deliveries whose consumer failed with an `E`.
///
/// Useful ahead of a catch-all strategy placed later in the chain.
pub struct NackOn<E> {
    _error: PhantomData<fn() -> E>,
}

impl<E> NackOn<E> {
    pub fn new() -> Self {
        NackOn {
            _error: PhantomData,
        }
    }
}

impl<E> Default for NackOn<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<E> Acknowledgement for NackOn<E>
where
    E: Error + 'static,
{
    async fn handle(
        &self,
        _delivery_info: &DeliveryInfo,
        _properties: &MessageProperties,
        _broker: &Broker,
        err: &HandlerError,
    ) -> Result<Option<AckDecision>, AmqpError> {
        Ok(err.downcast_ref::<E>().map(|_| AckDecision::Nack))
    }
}

/// Ordered strategies with the mandatory nack fallback.
#[derive(Clone, Default)]
pub struct AcknowledgementChain {
    strategies: Vec<Arc<dyn Acknowledgement>>,
}

impl AcknowledgementChain {
    pub fn new() -> AcknowledgementChain {
        AcknowledgementChain::default()
    }

    pub fn push(&mut self, strategy: Arc<dyn Acknowledgement>) {
        self.strategies.push(strategy);
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Asks each strategy in turn; falls back to a nack.
    pub async fn resolve(
        &self,
        delivery_info: &DeliveryInfo,
        properties: &MessageProperties,
        broker: &Broker,
        err: &HandlerError,
    ) -> AckDecision {
        for strategy in &self.strategies {
            let outcome =
                AssertUnwindSafe(strategy.handle(delivery_info, properties, broker, err))
                    .catch_unwind()
                    .await;

            match outcome {
                Ok(Ok(Some(decision))) => return decision,
                Ok(Ok(None)) => {}
                Ok(Err(strategy_err)) => error!(
                    error = strategy_err.to_string(),
                    "acknowledgement strategy failed, trying the next one"
                ),
                Err(_) => error!("acknowledgement strategy panicked, trying the next one"),
            }
        }

        NackOnAllFailures
            .handle(delivery_info, properties, broker, err)
            .await
            .ok()
            .flatten()
            .unwrap_or(AckDecision::Nack)
    }
}

impl fmt::Debug for AcknowledgementChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcknowledgementChain")
            .field("strategies", &self.strategies.len())
            .finish()
    }
}
