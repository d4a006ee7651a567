// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker
//!
//! The [`Broker`] owns the AMQP connection, the per-context channels, the
//! publish path and the work pool running subscriptions. It is shared as an
//! `Arc<Broker>` between the worker, the dispatcher and consumers.
//!
//! Acknowledgements are always issued on the channel a delivery arrived on.
//! When requested from another execution context they are queued and the
//! owning context drains them on its next tick.

use crate::{
    channel::{declaration_error, ChannelRegistry, ChannelSummary},
    config::{BrokerConfig, ConnectOptions},
    context::{ActionQueue, ContextId, PendingAction},
    errors::AmqpError,
    management::{ManagementApi, ManagementClient},
    message::{Body, DeliveryInfo, MessageProperties},
    pool::WorkPool,
    publisher::{GlobalProperties, PublishOptions, Publisher},
    queue::{namespaced, Queue, QueueDefinition},
    serializer::{self, Serializer},
    topology::{self, BindingTarget},
    transport::{DeliveryStream, Transport, TransportChannel, TransportConnection, TransportError},
};
use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Lifecycle of the broker connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

struct Session {
    connection: Arc<dyn TransportConnection>,
    api: Option<Arc<dyn ManagementApi>>,
}

pub struct Broker {
    config: Arc<BrokerConfig>,
    transport: Arc<dyn Transport>,
    management: Option<Arc<dyn ManagementApi>>,
    serializer: Arc<dyn Serializer>,
    publisher: Publisher,
    vhost: String,
    session: RwLock<Option<Session>>,
    connecting: AtomicBool,
    was_connected: AtomicBool,
    channels: ChannelRegistry,
    actions: ActionQueue,
    pool: WorkPool,
}

impl Broker {
    /// Creates a broker for `config`; nothing is opened until
    /// [`Broker::connect`].
    pub fn new(config: BrokerConfig, transport: Arc<dyn Transport>) -> Result<Broker, AmqpError> {
        config.validate()?;

        let serializer = serializer::by_id(&config.serializer).ok_or_else(|| {
            AmqpError::ConfigError(format!("unknown serializer `{}`", config.serializer))
        })?;
        let vhost = config.connection_params()?.vhost;
        let config = Arc::new(config);

        Ok(Broker {
            publisher: Publisher::new(serializer.clone(), None, config.force_publisher_confirms),
            pool: WorkPool::new(config.graceful_exit_timeout()),
            channels: ChannelRegistry::new(config.clone()),
            actions: ActionQueue::new(),
            vhost,
            session: RwLock::new(None),
            connecting: AtomicBool::new(false),
            was_connected: AtomicBool::new(false),
            management: None,
            serializer,
            transport,
            config,
        })
    }

    /// Uses `api` instead of building a [`ManagementClient`] from the config.
    pub fn with_management_api(mut self, api: Arc<dyn ManagementApi>) -> Self {
        self.management = Some(api);
        self
    }

    /// Properties merged into every publish, above the caller's own.
    pub fn with_global_properties(mut self, global: GlobalProperties) -> Self {
        self.publisher = Publisher::new(
            self.serializer.clone(),
            Some(global),
            self.config.force_publisher_confirms,
        );
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Process default serializer.
    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn work_pool(&self) -> &WorkPool {
        &self.pool
    }

    /// Opens the connection, declares the exchange on the calling context's
    /// channel and, if enabled, verifies the management API.
    pub async fn connect(&self, options: ConnectOptions) -> Result<(), AmqpError> {
        let open = self
            .session
            .read()
            .await
            .as_ref()
            .map(|session| session.connection.is_open());
        match open {
            Some(true) => {
                debug!("already connected to rabbitmq");
                return Ok(());
            }
            Some(false) => self.disconnect().await,
            None => {}
        }

        let params = self.config.connection_params()?;
        let uri = params.sanitized_uri();

        info!(uri, "connecting to rabbitmq");
        self.connecting.store(true, Ordering::SeqCst);
        let connected = self.transport.connect(&params).await;
        self.connecting.store(false, Ordering::SeqCst);

        let connection = connected.map_err(|err| {
            error!(error = err.to_string().to_lowercase(), "amqp connection error");
            match err {
                TransportError::ConnectionRefused(_) => AmqpError::ConnectionError(format!(
                    "couldn't connect to rabbitmq at {uri}. Check your configuration, \
                     network connectivity and RabbitMQ logs."
                )),
                other => AmqpError::ConnectionError(other.to_string()),
            }
        })?;
        info!(
            host = params.host,
            username = params.username,
            "connected to RabbitMQ"
        );

        *self.session.write().await = Some(Session {
            connection: connection.clone(),
            api: None,
        });
        self.was_connected.store(true, Ordering::SeqCst);

        if let Err(err) = self.setup(connection.as_ref(), options).await {
            self.disconnect().await;
            return Err(err);
        }

        Ok(())
    }

    async fn setup(
        &self,
        connection: &dyn TransportConnection,
        options: ConnectOptions,
    ) -> Result<(), AmqpError> {
        let broker = self.channels.current().await;
        broker.lock().await.exchange(connection).await?;

        if !(options.enable_http_api_use && self.config.enable_http_api_use) {
            info!("HTTP API use is disabled");
            return Ok(());
        }
        info!("HTTP API use is enabled");

        let api: Arc<dyn ManagementApi> = match &self.management {
            Some(api) => api.clone(),
            None => Arc::new(ManagementClient::new(self.config.api_params()?, &self.vhost)?),
        };
        api.exchanges().await?;

        if let Some(session) = self.session.write().await.as_mut() {
            session.api = Some(api);
        }
        Ok(())
    }

    /// Connects, runs `f`, and disconnects whatever `f` returned, even if it
    /// panicked.
    pub async fn with_connection<F, Fut, T>(
        self: &Arc<Self>,
        options: ConnectOptions,
        f: F,
    ) -> Result<T, AmqpError>
    where
        F: FnOnce(Arc<Broker>) -> Fut,
        Fut: Future<Output = Result<T, AmqpError>>,
    {
        self.connect(options).await?;

        let outcome = AssertUnwindSafe(f(self.clone())).catch_unwind().await;
        self.disconnect().await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Closes every channel and the connection. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        self.channels.disconnect_all().await;

        let Some(session) = self.session.write().await.take() else {
            return;
        };

        if session.connection.is_open() {
            if let Err(err) = session.connection.close().await {
                warn!(error = err.to_string(), "failure to close connection");
            }
        }
        info!("disconnected from rabbitmq");
    }

    pub async fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            return ConnectionState::Connecting;
        }

        match self.session.read().await.as_ref() {
            Some(session) if session.connection.is_open() => ConnectionState::Connected,
            Some(_) => ConnectionState::Closed,
            None if self.was_connected.load(Ordering::SeqCst) => ConnectionState::Closed,
            None => ConnectionState::Disconnected,
        }
    }

    async fn connection(&self) -> Result<Arc<dyn TransportConnection>, &'static str> {
        match self.session.read().await.as_ref() {
            None => Err("no connection to broker"),
            Some(session) if !session.connection.is_open() => Err("connection is closed"),
            Some(session) => Ok(session.connection.clone()),
        }
    }

    async fn api(&self) -> Option<Arc<dyn ManagementApi>> {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|session| session.api.clone())
    }

    async fn current_channel(&self) -> Result<Arc<dyn TransportChannel>, AmqpError> {
        let connection = self
            .connection()
            .await
            .map_err(|reason| AmqpError::ConnectionError(reason.to_owned()))?;
        let broker = self.channels.current().await;
        let mut broker = broker.lock().await;
        broker.channel(connection.as_ref()).await
    }

    /// Declares a durable queue, prefixed with the configured namespace.
    pub async fn queue(
        &self,
        name: &str,
        arguments: BTreeMap<String, Value>,
    ) -> Result<Queue, AmqpError> {
        let name = namespaced(self.config.namespace.as_deref(), name);
        let channel = self.current_channel().await?;

        debug!(queue = name, "declaring queue");
        let def = QueueDefinition::new(&name).durable().arguments(arguments);
        channel.declare_queue(&def).await.map_err(|err| {
            declaration_error(err, "queue", AmqpError::DeclareQueueError(name.clone()))
        })?;

        Ok(Queue::new(name))
    }

    /// Makes the bindings of `queue` on the main exchange equal
    /// `routing_keys`; additive only when the management API is off.
    pub async fn bind_queue(&self, queue: &Queue, routing_keys: &[String]) -> Result<(), AmqpError> {
        let channel = self.current_channel().await?;
        let api = self.api().await;

        topology::reconcile(
            channel.as_ref(),
            api.as_deref(),
            BindingTarget {
                exchange: &self.config.mq_exchange,
                vhost: &self.vhost,
            },
            queue.name(),
            routing_keys,
        )
        .await
    }

    /// Queue name to bound routing keys, as reported by the management API.
    pub async fn bindings(&self) -> Result<HashMap<String, Vec<String>>, AmqpError> {
        let api = self.api().await.ok_or_else(|| {
            AmqpError::ManagementApiError("HTTP API use is disabled".to_owned())
        })?;

        Ok(topology::group_bindings(
            api.bindings().await?,
            &self.config.mq_exchange,
            &self.vhost,
        ))
    }

    /// Publishes `body` to the main exchange.
    pub async fn publish(
        &self,
        routing_key: &str,
        body: &Body,
        properties: MessageProperties,
        options: PublishOptions,
    ) -> Result<(), AmqpError> {
        let connection = self.ensure_connection(routing_key, body).await?;
        let outgoing = self
            .publisher
            .build(routing_key, body, properties, &options)?;

        let broker = self.channels.current().await;
        let exchange = broker.lock().await.exchange(connection.as_ref()).await?;
        self.publisher.send(&exchange, &outgoing).await
    }

    /// Publishes `body` to the wait exchange matching its `expiration`, from
    /// where it is dead-lettered back to the main exchange once expired.
    pub async fn publish_wait(
        &self,
        routing_key: &str,
        body: &Body,
        properties: MessageProperties,
    ) -> Result<(), AmqpError> {
        let connection = self.ensure_connection(routing_key, body).await?;
        if self.config.mq_wait_exchange.is_none() {
            return Err(self.publish_error("no wait exchange configured", routing_key, body));
        }

        let expiration = properties.expiration.clone();
        let outgoing = self.publisher.build(
            routing_key,
            body,
            properties,
            &PublishOptions::default(),
        )?;

        let broker = self.channels.current().await;
        let waits = broker.lock().await.wait_exchanges(connection.as_ref()).await?;
        self.publisher
            .send(waits.select(expiration.as_deref()), &outgoing)
            .await
    }

    async fn ensure_connection(
        &self,
        routing_key: &str,
        body: &Body,
    ) -> Result<Arc<dyn TransportConnection>, AmqpError> {
        self.connection()
            .await
            .map_err(|reason| self.publish_error(reason, routing_key, body))
    }

    fn publish_error(&self, reason: &str, routing_key: &str, body: &Body) -> AmqpError {
        let msg = format!(
            "unable to publish - {reason}. Message: {body}, Routing key: {routing_key}."
        );
        error!("{}", msg);
        AmqpError::PublishError(msg)
    }

    /// Starts a manual-acknowledgement subscription on the calling context's
    /// channel.
    pub async fn subscribe(
        &self,
        queue: &Queue,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        let connection = self
            .connection()
            .await
            .map_err(|reason| AmqpError::ConnectionError(reason.to_owned()))?;
        let broker = self.channels.current().await;
        let (channel, generation) = {
            let mut broker = broker.lock().await;
            let channel = broker.channel(connection.as_ref()).await?;
            (channel, broker.generation())
        };

        debug!(queue = queue.name(), consumer_tag, generation, "subscribing");
        let deliveries = channel.consume(queue.name(), consumer_tag).await.map_err(|err| {
            error!(error = err.to_string(), "error to create the consumer");
            AmqpError::ConsumerDeclarationError(queue.name().to_owned())
        })?;

        Ok(deliveries
            .map(move |delivery| {
                delivery.map(|mut delivery| {
                    delivery.delivery_info.channel_generation = generation;
                    delivery
                })
            })
            .boxed())
    }

    pub async fn ack(&self, delivery: &DeliveryInfo) -> Result<(), AmqpError> {
        self.settle(delivery, PendingAction::Ack(delivery.delivery_tag))
            .await
    }

    pub async fn nack(&self, delivery: &DeliveryInfo) -> Result<(), AmqpError> {
        self.settle(delivery, PendingAction::Nack(delivery.delivery_tag))
            .await
    }

    pub async fn reject(&self, delivery: &DeliveryInfo, requeue: bool) -> Result<(), AmqpError> {
        self.settle(
            delivery,
            PendingAction::Reject {
                delivery_tag: delivery.delivery_tag,
                requeue,
            },
        )
        .await
    }

    /// `reject` with the requeue flag set.
    pub async fn requeue(&self, delivery: &DeliveryInfo) -> Result<(), AmqpError> {
        self.reject(delivery, true).await
    }

    async fn settle(&self, delivery: &DeliveryInfo, action: PendingAction) -> Result<(), AmqpError> {
        if ContextId::current() != delivery.context {
            debug!(owner = %delivery.context, ?action, "queueing acknowledgement for owning context");
            self.actions
                .push(delivery.context, delivery.channel_generation, action)
                .await;
            return Ok(());
        }

        self.execute(delivery.context, delivery.channel_generation, action)
            .await
    }

    async fn execute(
        &self,
        owner: ContextId,
        generation: u64,
        action: PendingAction,
    ) -> Result<(), AmqpError> {
        let channel = match self.channels.get(owner).await {
            Some(broker) => broker.lock().await.channel_if_current(generation),
            None => None,
        };

        let Some(channel) = channel else {
            warn!(
                context = %owner,
                generation,
                ?action,
                "channel was closed or replaced, dropping acknowledgement"
            );
            return Ok(());
        };

        match action {
            PendingAction::Ack(tag) => channel.ack(tag).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            }),
            PendingAction::Nack(tag) => channel.nack(tag, false).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling nack msg");
                AmqpError::NackMessageError
            }),
            PendingAction::Reject {
                delivery_tag,
                requeue,
            } => channel.reject(delivery_tag, requeue).await.map_err(|err| {
                error!(error = err.to_string(), "error whiling reject msg");
                if requeue {
                    AmqpError::RequeuingMessageError
                } else {
                    AmqpError::NackMessageError
                }
            }),
        }
    }

    /// Runs the acknowledgements other contexts queued for the calling one.
    pub async fn drain_pending_actions(&self) -> usize {
        let owner = ContextId::current();
        let actions = self.actions.take(owner).await;
        let count = actions.len();

        for (generation, action) in actions {
            if let Err(err) = self.execute(owner, generation, action).await {
                error!(error = err.to_string(), "failure to run queued acknowledgement");
            }
        }

        count
    }

    pub async fn confirm_select(&self) -> Result<(), AmqpError> {
        self.current_channel()
            .await?
            .confirm_select()
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }

    pub async fn wait_for_confirms(&self) -> Result<(), AmqpError> {
        self.current_channel()
            .await?
            .wait_for_confirms()
            .await
            .map_err(|err| AmqpError::PublishError(format!("unconfirmed publish: {err}")))
    }

    pub async fn using_publisher_confirmations(&self) -> Result<bool, AmqpError> {
        Ok(self
            .current_channel()
            .await?
            .using_publisher_confirmations())
    }

    pub async fn describe_channels(&self) -> Vec<ChannelSummary> {
        self.channels.summaries().await
    }

    /// Stops the subscriptions: intake ends at once, in-flight deliveries get
    /// `graceful_exit_timeout` to finish.
    pub async fn stop(&self) {
        self.pool.stop().await;
    }
}
