// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! AMQP channels must not be used concurrently from several execution
//! contexts. A [`ChannelBroker`] owns the channel, the main exchange and the
//! wait exchanges of exactly one context, and the [`ChannelRegistry`] maps
//! each [`ContextId`] to its broker.
//!
//! Handles are opened lazily and reopened whenever the channel is found
//! inactive, so a channel closed by the broker heals on its next use.

use crate::{
    config::BrokerConfig,
    context::ContextId,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeHandle},
    transport::{ChannelOptions, TransportChannel, TransportConnection, TransportError},
    wait_exchange::WaitExchanges,
};
use std::{collections::HashMap, fmt, sync::Arc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Translates a failed declaration of `entity` (`"exchange"`, `"queue"`).
///
/// Precondition failures mean the entity already exists with different
/// attributes, which no retry will fix.
pub(crate) fn declaration_error(
    err: TransportError,
    entity: &str,
    fallback: AmqpError,
) -> AmqpError {
    match err {
        TransportError::PreconditionFailed(reason) => {
            error!(error = reason, "declaration conflict");
            AmqpError::WorkerSetupError(format!(
                "RabbitMQ responded with 406 Precondition Failed when creating this {entity}. \
                 Perhaps it is being redeclared with non-matching attributes"
            ))
        }
        TransportError::ConnectionRefused(reason) => AmqpError::ConnectionError(reason),
        TransportError::ChannelClosed(reason) => AmqpError::ChannelError(reason),
        TransportError::Other(reason) => {
            error!(error = reason, "declaration failed");
            fallback
        }
    }
}

struct OpenChannel {
    channel: Arc<dyn TransportChannel>,
    exchange: ExchangeHandle,
    wait_exchanges: Option<Arc<WaitExchanges>>,
}

/// Channel, exchange and wait exchanges of one execution context.
pub struct ChannelBroker {
    config: Arc<BrokerConfig>,
    open: Option<OpenChannel>,
    generation: u64,
}

impl ChannelBroker {
    pub fn new(config: Arc<BrokerConfig>) -> ChannelBroker {
        ChannelBroker {
            config,
            open: None,
            generation: 0,
        }
    }

    /// Counts the channels this context has given up; deliveries are stamped
    /// with it so their tags are never used on a later channel.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True while the channel is open and was not closed by the broker.
    pub fn active(&self) -> bool {
        self.open
            .as_ref()
            .map(|open| open.channel.is_active())
            .unwrap_or(false)
    }

    pub async fn channel(
        &mut self,
        conn: &dyn TransportConnection,
    ) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        Ok(self.ensure_open(conn).await?.channel.clone())
    }

    pub async fn exchange(
        &mut self,
        conn: &dyn TransportConnection,
    ) -> Result<ExchangeHandle, AmqpError> {
        Ok(self.ensure_open(conn).await?.exchange.clone())
    }

    /// Declares the wait exchanges on first use.
    pub async fn wait_exchanges(
        &mut self,
        conn: &dyn TransportConnection,
    ) -> Result<Arc<WaitExchanges>, AmqpError> {
        let config = self.config.clone();
        let Some(name) = config.mq_wait_exchange.as_deref() else {
            return Err(AmqpError::PublishError(
                "no wait exchange configured".to_owned(),
            ));
        };

        let open = self.ensure_open(conn).await?;
        if let Some(waits) = &open.wait_exchanges {
            return Ok(waits.clone());
        }

        let waits = Arc::new(WaitExchanges::declare(&open.channel, &config, name).await?);
        open.wait_exchanges = Some(waits.clone());
        Ok(waits)
    }

    pub async fn default_wait_exchange(
        &mut self,
        conn: &dyn TransportConnection,
    ) -> Result<ExchangeHandle, AmqpError> {
        Ok(self.wait_exchanges(conn).await?.default_exchange().clone())
    }

    /// The channel of `generation` if it is still usable, without reopening
    /// it.
    ///
    /// Delivery tags only mean something on the channel they arrived on, so
    /// acknowledgements must never trigger a reconnect.
    pub fn channel_if_current(&self, generation: u64) -> Option<Arc<dyn TransportChannel>> {
        if generation != self.generation {
            return None;
        }

        self.open
            .as_ref()
            .filter(|open| open.channel.is_active())
            .map(|open| open.channel.clone())
    }

    /// Closes the channel if active and drops every cached handle.
    pub async fn disconnect(&mut self) {
        let Some(open) = self.open.take() else {
            return;
        };
        self.generation += 1;

        if open.channel.is_active() {
            if let Err(err) = open.channel.close().await {
                warn!(error = err.to_string(), "failure to close channel");
            }
        }
    }

    /// Replaces the channel with a fresh one and redeclares the exchange.
    pub async fn reconnect(&mut self, conn: &dyn TransportConnection) -> Result<(), AmqpError> {
        self.disconnect().await;

        let options = ChannelOptions {
            prefetch: self.config.channel_prefetch,
            publisher_confirms: self.config.publisher_confirms
                || self.config.force_publisher_confirms,
        };
        info!(
            prefetch = options.prefetch,
            "opening rabbitmq channel"
        );
        if options.publisher_confirms {
            info!("enabling publisher confirms");
        }

        let channel = conn
            .create_channel(options)
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))?;

        let name = &self.config.mq_exchange;
        let def = ExchangeDefinition::new(name)
            .kind(self.config.mq_exchange_type.clone())
            .durable()
            .params(self.config.mq_exchange_arguments.clone());

        info!(exchange = name, kind = %self.config.mq_exchange_type, "using exchange");
        if let Err(err) = channel.declare_exchange(&def).await {
            if channel.is_active() {
                let _ = channel.close().await;
            }
            return Err(declaration_error(
                err,
                "exchange",
                AmqpError::DeclareExchangeError(name.clone()),
            ));
        }

        self.open = Some(OpenChannel {
            exchange: ExchangeHandle::new(name, channel.clone()),
            channel,
            wait_exchanges: None,
        });
        Ok(())
    }

    async fn ensure_open(
        &mut self,
        conn: &dyn TransportConnection,
    ) -> Result<&mut OpenChannel, AmqpError> {
        if !self.active() {
            if self.open.is_some() {
                debug!("channel is no longer active, reopening");
            }
            self.reconnect(conn).await?;
        }

        self.open.as_mut().ok_or(AmqpError::InternalError)
    }
}

impl fmt::Debug for ChannelBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelBroker")
            .field("active", &self.active())
            .finish()
    }
}

/// State of one context's channel, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSummary {
    pub context: ContextId,
    pub active: bool,
}

/// Maps execution contexts to their channel brokers.
pub struct ChannelRegistry {
    config: Arc<BrokerConfig>,
    brokers: Mutex<HashMap<ContextId, Arc<Mutex<ChannelBroker>>>>,
}

impl ChannelRegistry {
    pub fn new(config: Arc<BrokerConfig>) -> ChannelRegistry {
        ChannelRegistry {
            config,
            brokers: Mutex::new(HashMap::new()),
        }
    }

    /// The broker of the calling context, created on first use.
    pub async fn current(&self) -> Arc<Mutex<ChannelBroker>> {
        let context = ContextId::current();
        let mut brokers = self.brokers.lock().await;

        brokers
            .entry(context)
            .or_insert_with(|| Arc::new(Mutex::new(ChannelBroker::new(self.config.clone()))))
            .clone()
    }

    /// The broker of `context`, if it ever opened one.
    pub async fn get(&self, context: ContextId) -> Option<Arc<Mutex<ChannelBroker>>> {
        self.brokers.lock().await.get(&context).cloned()
    }

    /// Closes every context's channel. Brokers stay registered so their
    /// generations keep counting across reconnects.
    pub async fn disconnect_all(&self) {
        let brokers: Vec<_> = self
            .brokers
            .lock()
            .await
            .iter()
            .map(|(context, broker)| (*context, broker.clone()))
            .collect();

        for (context, broker) in brokers {
            debug!(%context, "closing channel");
            broker.lock().await.disconnect().await;
        }
    }

    pub async fn summaries(&self) -> Vec<ChannelSummary> {
        let brokers: Vec<_> = self
            .brokers
            .lock()
            .await
            .iter()
            .map(|(context, broker)| (*context, broker.clone()))
            .collect();

        let mut summaries = Vec::with_capacity(brokers.len());
        for (context, broker) in brokers {
            summaries.push(ChannelSummary {
                context,
                active: broker.lock().await.active(),
            });
        }
        summaries.sort_by_key(|summary| summary.context);
        summaries
    }
}
