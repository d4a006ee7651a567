// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Worker
//!
//! Declares a queue per registered consumer, reconciles its bindings and
//! subscribes to it. Every subscription gets its own execution context, and
//! so its own channel, and runs in the broker's work pool until shutdown.
//!
//! A subscription whose delivery stream ends is resubscribed every
//! `network_recovery_interval` while `automatically_recover` is set. Otherwise,
//! or once the connection itself is gone, the work pool is told to give up and
//! the worker stops.

use crate::{
    broker::Broker,
    config::consumer_tag,
    consumer::{ConsumerDescriptor, ConsumerRegistry},
    context::ContextId,
    dispatcher::{MessageDispatcher, SubscriptionEnd},
    errors::AmqpError,
    queue::Queue,
    transport::DeliveryStream,
    waiter::{Signal, Waiter},
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

pub struct Worker {
    broker: Arc<Broker>,
    consumers: ConsumerRegistry,
    dispatcher: Arc<MessageDispatcher>,
}

impl Worker {
    pub fn new(
        broker: Arc<Broker>,
        consumers: ConsumerRegistry,
        dispatcher: Arc<MessageDispatcher>,
    ) -> Worker {
        Worker {
            broker,
            consumers,
            dispatcher,
        }
    }

    /// Sets up the queues, then blocks until a shutdown signal and stops
    /// the broker.
    pub async fn run(&self) -> Result<Signal, AmqpError> {
        let waiter = Waiter::install()?;
        self.run_until(waiter).await
    }

    /// [`Worker::run`] with the signals supplied by `waiter`.
    pub async fn run_until(&self, mut waiter: Waiter) -> Result<Signal, AmqpError> {
        self.setup_queues().await?;

        let signal = waiter.wait_until_signaled(&self.broker).await;
        self.broker.stop().await;

        Ok(signal)
    }

    /// Starts a subscription for every consumer selected by the configured
    /// group. Setup failures are reported to the error handlers and returned.
    pub async fn setup_queues(&self) -> Result<(), AmqpError> {
        for descriptor in self.consumers.iter().filter(|c| self.is_selected(c)) {
            if let Err(err) = self.setup_queue(descriptor).await {
                self.dispatcher.error_handlers().notify_setup(&err).await;
                return Err(err);
            }
        }

        Ok(())
    }

    fn is_selected(&self, descriptor: &ConsumerDescriptor) -> bool {
        let config = self.broker.config();
        let Some(group) = config.group.as_deref() else {
            return true;
        };

        let listed = config
            .consumer_groups
            .get(group)
            .is_some_and(|members| members.iter().any(|name| name == descriptor.name()));

        let selected = listed || descriptor.get_group() == Some(group);
        if !selected {
            debug!(
                consumer = descriptor.name(),
                group, "consumer not in the active group, skipping"
            );
        }
        selected
    }

    async fn setup_queue(&self, descriptor: &ConsumerDescriptor) -> Result<(), AmqpError> {
        let tag = consumer_tag(&self.broker.config().consumer_tag_prefix)?;
        let queue = self
            .broker
            .queue(&descriptor.get_queue_name(), descriptor.get_arguments().clone())
            .await?;
        self.broker
            .bind_queue(&queue, descriptor.routing_keys())
            .await?;

        info!(
            queue = queue.name(),
            consumer = descriptor.name(),
            consumer_tag = tag,
            "setting up queue"
        );

        let context = ContextId::next();
        let deliveries = context
            .scope(self.broker.subscribe(&queue, &tag))
            .await?;

        let subscription = Subscription {
            broker: self.broker.clone(),
            dispatcher: self.dispatcher.clone(),
            descriptor: descriptor.clone(),
            queue,
            tag,
        };

        self.broker
            .work_pool()
            .spawn(context.scope(subscription.run(deliveries)))
            .await;

        Ok(())
    }
}

/// One consumer's subscription, kept alive across lost delivery streams.
struct Subscription {
    broker: Arc<Broker>,
    dispatcher: Arc<MessageDispatcher>,
    descriptor: ConsumerDescriptor,
    queue: Queue,
    tag: String,
}

impl Subscription {
    async fn run(self, mut deliveries: DeliveryStream) {
        let mut shutdown = self.broker.work_pool().shutdown_signal();

        loop {
            let end = self
                .dispatcher
                .consume(&self.descriptor, deliveries, shutdown.clone())
                .await;
            if end == SubscriptionEnd::Shutdown {
                return;
            }

            if !self.broker.config().automatically_recover {
                self.broker
                    .work_pool()
                    .abandon(&format!("subscription to {} ended", self.queue.name()));
                return;
            }

            deliveries = match self.resubscribe(&mut shutdown).await {
                Some(deliveries) => deliveries,
                None => return,
            };
        }
    }

    /// Retries the subscription until it succeeds, shutdown is requested or
    /// the connection is gone.
    async fn resubscribe(&self, shutdown: &mut watch::Receiver<bool>) -> Option<DeliveryStream> {
        let interval = self.broker.config().network_recovery_interval();

        loop {
            warn!(
                queue = self.queue.name(),
                consumer = self.descriptor.name(),
                retry_in = ?interval,
                "subscription lost, resubscribing"
            );
            tokio::select! {
                _ = stopped(shutdown) => return None,
                _ = tokio::time::sleep(interval) => {}
            }

            match self.broker.subscribe(&self.queue, &self.tag).await {
                Ok(deliveries) => {
                    info!(queue = self.queue.name(), consumer_tag = self.tag, "resubscribed");
                    return Some(deliveries);
                }
                Err(AmqpError::ConnectionError(reason)) => {
                    self.broker.work_pool().abandon(&format!(
                        "can't resubscribe to {}: {reason}",
                        self.queue.name()
                    ));
                    return None;
                }
                Err(err) => {
                    error!(
                        error = err.to_string(),
                        queue = self.queue.name(),
                        "failure to resubscribe"
                    );
                }
            }
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{BrokerConfig, ConnectOptions},
        consumer::{Consumer, ConsumerContext},
        error_handlers::ErrorHandler,
        errors::HandlerError,
        message::{Message, MessageProperties},
        test_support::{settlements, test_config, MemoryTransport, Op},
    };
    use async_trait::async_trait;
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tokio::sync::mpsc;

    struct Recording {
        seen: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Consumer for Recording {
        async fn process(&self, _: &ConsumerContext, message: &Message) -> Result<(), HandlerError> {
            self.seen.lock().unwrap().push(message.routing_key().to_owned());
            Ok(())
        }
    }

    fn recording(name: &str, seen: &Arc<Mutex<Vec<String>>>) -> ConsumerDescriptor {
        let seen = seen.clone();
        ConsumerDescriptor::with_factory(name, move || {
            Box::new(Recording { seen: seen.clone() })
        })
    }

    #[derive(Default)]
    struct SetupCounter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ErrorHandler for SetupCounter {
        async fn handle(
            &self,
            _: &MessageProperties,
            _: &[u8],
            _: &ConsumerDescriptor,
            _: &HandlerError,
        ) -> Result<(), HandlerError> {
            Ok(())
        }

        async fn handle_setup_error(&self, _: &AmqpError) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn worker(
        config: BrokerConfig,
        transport: &MemoryTransport,
        consumers: ConsumerRegistry,
    ) -> (Worker, Arc<SetupCounter>) {
        let broker = Arc::new(Broker::new(config, Arc::new(transport.clone())).unwrap());
        broker.connect(ConnectOptions::default()).await.unwrap();

        let counter = Arc::new(SetupCounter::default());
        let dispatcher =
            Arc::new(MessageDispatcher::new(broker.clone()).with_error_handler(counter.clone()));

        (Worker::new(broker, consumers, dispatcher), counter)
    }

    fn consumes(ops: &[Op]) -> Vec<(String, String)> {
        ops.iter()
            .filter_map(|op| match op {
                Op::Consume {
                    queue,
                    consumer_tag,
                } => Some((queue.clone(), consumer_tag.clone())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn queues_are_declared_bound_and_subscribed() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Foo::BarBaz", &seen).consume(["a.b", "c.d"]));

        let (worker, _) = worker(test_config(), &transport, consumers).await;
        worker.setup_queues().await.unwrap();

        assert_eq!(transport.bound_keys("foo:bar_baz"), vec!["a.b", "c.d"]);

        let subscriptions = consumes(&transport.ops());
        assert_eq!(subscriptions.len(), 1);
        assert_eq!(subscriptions[0].0, "foo:bar_baz");
        assert!(subscriptions[0].1.starts_with("burrow-"));

        // main context plus the subscription's own
        assert_eq!(transport.channel_count(), 2);
        assert_eq!(worker.broker.work_pool().len().await, 1);

        worker.broker.stop().await;
    }

    #[tokio::test]
    async fn deliveries_reach_the_consumer_and_are_acked() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Orders", &seen).consume(["order.created"]));

        let (worker, _) = worker(test_config(), &transport, consumers).await;
        worker.setup_queues().await.unwrap();

        let tag = transport.deliver("orders", "order.created", b"{}", MessageProperties::new());

        tokio::time::timeout(Duration::from_secs(5), async {
            while settlements(&transport.ops()).is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec!["order.created".to_owned()]);
        assert_eq!(
            settlements(&transport.ops()),
            vec![Op::Ack { channel: 0, delivery_tag: tag }]
        );

        worker.broker.stop().await;
    }

    #[tokio::test]
    async fn group_filter_limits_the_started_consumers() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Listed", &seen));
        consumers.register(recording("Tagged", &seen).group("billing"));
        consumers.register(recording("Other", &seen));

        let config = BrokerConfig {
            group: Some("billing".to_owned()),
            consumer_groups: HashMap::from([("billing".to_owned(), vec!["Listed".to_owned()])]),
            ..test_config()
        };

        let (worker, _) = worker(config, &transport, consumers).await;
        worker.setup_queues().await.unwrap();

        let queues: Vec<String> = consumes(&transport.ops())
            .into_iter()
            .map(|(queue, _)| queue)
            .collect();
        assert_eq!(queues, vec!["listed", "tagged"]);

        worker.broker.stop().await;
    }

    #[tokio::test]
    async fn setup_failures_reach_the_error_handlers() {
        let transport = MemoryTransport::new();
        transport.conflict_on("broken");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Broken", &seen));

        let (worker, counter) = worker(test_config(), &transport, consumers).await;
        let err = worker.setup_queues().await.unwrap_err();

        assert!(matches!(err, AmqpError::WorkerSetupError(_)));
        assert_eq!(counter.calls.load(Ordering::SeqCst), 1);
        assert!(consumes(&transport.ops()).is_empty());
    }

    #[tokio::test]
    async fn run_until_stops_the_subscriptions_on_shutdown_signals() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Foo", &seen).consume(["foo"]));

        let (worker, _) = worker(test_config(), &transport, consumers).await;
        let (sender, receiver) = mpsc::unbounded_channel();
        sender.send(Signal::User2).unwrap();
        sender.send(Signal::Interrupt).unwrap();

        let signal = worker.run_until(Waiter::from_receiver(receiver)).await.unwrap();

        assert_eq!(signal, Signal::Interrupt);
        assert!(worker.broker.work_pool().is_stopping());
        assert_eq!(worker.broker.work_pool().len().await, 0);
    }

    async fn eventually(mut done: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn cancelled_subscriptions_are_resubscribed() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Orders", &seen).consume(["order.created"]));

        let config = BrokerConfig {
            network_recovery_interval: 0,
            ..test_config()
        };
        let (worker, _) = worker(config, &transport, consumers).await;
        worker.setup_queues().await.unwrap();

        transport.cancel("orders");
        eventually(|| consumes(&transport.ops()).len() == 2).await;

        let subscriptions = consumes(&transport.ops());
        assert_eq!(subscriptions[0], subscriptions[1]);

        let tag = transport.deliver("orders", "order.created", b"{}", MessageProperties::new());
        eventually(|| !settlements(&transport.ops()).is_empty()).await;
        assert_eq!(
            settlements(&transport.ops()),
            vec![Op::Ack { channel: 0, delivery_tag: tag }]
        );
        assert!(!worker.broker.work_pool().is_abandoned());

        worker.broker.stop().await;
    }

    #[tokio::test]
    async fn lost_subscriptions_stop_the_worker_without_recovery() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Foo", &seen).consume(["foo"]));

        let config = BrokerConfig {
            automatically_recover: false,
            ..test_config()
        };
        let (worker, _) = worker(config, &transport, consumers).await;

        let canceller = {
            let transport = transport.clone();
            tokio::spawn(async move {
                eventually(|| !consumes(&transport.ops()).is_empty()).await;
                transport.cancel("foo");
            })
        };
        let (_sender, receiver) = mpsc::unbounded_channel();

        let signal = tokio::time::timeout(
            Duration::from_secs(5),
            worker.run_until(Waiter::from_receiver(receiver)),
        )
        .await
        .unwrap()
        .unwrap();
        canceller.await.unwrap();

        assert_eq!(signal, Signal::Terminate);
        assert!(worker.broker.work_pool().is_abandoned());
        assert_eq!(consumes(&transport.ops()).len(), 1);
    }

    #[tokio::test]
    async fn recovery_gives_up_once_the_connection_is_gone() {
        let transport = MemoryTransport::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut consumers = ConsumerRegistry::new();
        consumers.register(recording("Orders", &seen));

        let config = BrokerConfig {
            network_recovery_interval: 0,
            ..test_config()
        };
        let (worker, _) = worker(config, &transport, consumers).await;
        worker.setup_queues().await.unwrap();

        transport.close_connection();
        transport.cancel("orders");
        eventually(|| worker.broker.work_pool().is_abandoned()).await;

        assert_eq!(consumes(&transport.ops()).len(), 1);
        worker.broker.stop().await;
    }
}
