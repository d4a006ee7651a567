// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Wait Exchanges
//!
//! Delayed redelivery without broker plugins. A message published to a wait
//! exchange lands in a durable queue nobody consumes from; once its
//! `expiration` elapses RabbitMQ dead-letters it back into the main exchange
//! with the original routing key, where the regular consumers pick it up.
//!
//! Besides the default pair, one exchange/queue pair is declared per
//! configured expiration suffix so that each queue only ever holds messages
//! with a single TTL. Queues dead-letter in FIFO order, so mixing TTLs in one
//! queue would hold short delays behind long ones.

use crate::{
    channel::declaration_error,
    config::BrokerConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeHandle},
    queue::QueueDefinition,
    transport::TransportChannel,
};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

/// The wait exchanges declared on one channel.
#[derive(Debug, Clone)]
pub struct WaitExchanges {
    default: ExchangeHandle,
    by_suffix: HashMap<String, ExchangeHandle>,
}

impl WaitExchanges {
    /// Declares the default wait exchange named `exchange` and one extra
    /// pair per `mq_wait_expiration_suffices` entry.
    pub(crate) async fn declare(
        channel: &Arc<dyn TransportChannel>,
        config: &BrokerConfig,
        exchange: &str,
    ) -> Result<WaitExchanges, AmqpError> {
        let default = declare_pair(
            channel,
            exchange,
            &config.mq_wait_queue,
            &config.mq_exchange,
        )
        .await?;

        let mut by_suffix = HashMap::new();
        for suffix in &config.mq_wait_expiration_suffices {
            let handle = declare_pair(
                channel,
                &format!("{exchange}_{suffix}"),
                &format!("{}_{}", config.mq_wait_queue, suffix),
                &config.mq_exchange,
            )
            .await?;
            by_suffix.insert(suffix.clone(), handle);
        }

        Ok(WaitExchanges { default, by_suffix })
    }

    pub fn default_exchange(&self) -> &ExchangeHandle {
        &self.default
    }

    /// Exchange for messages expiring after `expiration`; unknown or missing
    /// expirations go to the default exchange.
    pub fn select(&self, expiration: Option<&str>) -> &ExchangeHandle {
        expiration
            .and_then(|expiration| self.by_suffix.get(expiration))
            .unwrap_or(&self.default)
    }
}

async fn declare_pair(
    channel: &Arc<dyn TransportChannel>,
    exchange: &str,
    queue: &str,
    dead_letter_exchange: &str,
) -> Result<ExchangeHandle, AmqpError> {
    info!(exchange, queue, "using wait exchange");

    let exchange_def = ExchangeDefinition::new(exchange).fanout().durable();
    channel
        .declare_exchange(&exchange_def)
        .await
        .map_err(|err| {
            declaration_error(err, "exchange", AmqpError::DeclareExchangeError(exchange.into()))
        })?;

    let queue_def = QueueDefinition::new(queue)
        .durable()
        .dead_letter_to(dead_letter_exchange);
    channel.declare_queue(&queue_def).await.map_err(|err| {
        declaration_error(err, "queue", AmqpError::DeclareQueueError(queue.into()))
    })?;

    debug!(exchange, queue, "binding wait queue");
    channel.bind_queue(queue, exchange, "").await.map_err(|_| {
        AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
    })?;

    Ok(ExchangeHandle::new(exchange, channel.clone()))
}
