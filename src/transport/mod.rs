// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Transport Adapter
//!
//! The broker talks to RabbitMQ only through these traits. The production
//! implementation lives in [`lapin`](self::lapin); tests use an in-memory
//! recording transport.
//!
//! Adapters report failures as [`TransportError`]. The two conditions the
//! broker has to translate for users are kept apart: `ConnectionRefused`
//! (nothing listening, handshake timed out) and `PreconditionFailed`
//! (a declaration conflicting with an existing entity).

pub mod lapin;

use crate::{
    config::ConnectionParams,
    exchange::ExchangeDefinition,
    message::{DeliveryInfo, MessageProperties},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("channel closed: {0}")]
    ChannelClosed(String),

    #[error("{0}")]
    Other(String),
}

/// One message handed over by the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_info: DeliveryInfo,
    pub properties: MessageProperties,
    pub payload: Vec<u8>,
}

/// Stream of deliveries for one subscription.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, TransportError>>;

/// Per-channel settings applied right after the channel is opened.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelOptions {
    /// basic.qos prefetch count; zero means unlimited
    pub prefetch: u16,
    pub publisher_confirms: bool,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn TransportConnection>, TransportError>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync {
    async fn create_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Arc<dyn TransportChannel>, TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait TransportChannel: Send + Sync {
    /// False once the channel was closed by either side.
    fn is_active(&self) -> bool;

    fn using_publisher_confirmations(&self) -> bool;

    async fn close(&self) -> Result<(), TransportError>;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TransportError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError>;

    async fn confirm_select(&self) -> Result<(), TransportError>;

    async fn wait_for_confirms(&self) -> Result<(), TransportError>;

    /// Starts a manual-acknowledgement subscription on `queue`.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;
}
