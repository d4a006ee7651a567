// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory transport recording every operation, for unit tests.

use crate::{
    config::{BrokerConfig, ConnectionParams},
    context::ContextId,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{DeliveryInfo, MessageProperties},
    queue::QueueDefinition,
    transport::{
        ChannelOptions, Delivery, DeliveryStream, Transport, TransportChannel,
        TransportConnection, TransportError,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Connect,
    CloseConnection,
    CreateChannel {
        id: usize,
        prefetch: u16,
        confirms: bool,
    },
    CloseChannel(usize),
    DeclareExchange {
        name: String,
        kind: ExchangeKind,
        durable: bool,
    },
    DeclareQueue {
        name: String,
        durable: bool,
        arguments: BTreeMap<String, Value>,
    },
    Bind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Unbind {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Vec<u8>,
        properties: MessageProperties,
    },
    ConfirmSelect,
    WaitForConfirms,
    Consume {
        queue: String,
        consumer_tag: String,
    },
    Ack {
        channel: usize,
        delivery_tag: u64,
    },
    Nack {
        channel: usize,
        delivery_tag: u64,
        requeue: bool,
    },
    Reject {
        channel: usize,
        delivery_tag: u64,
        requeue: bool,
    },
}

struct Subscription {
    sender: mpsc::UnboundedSender<Delivery>,
    context: ContextId,
    consumer_tag: String,
}

#[derive(Default)]
struct Shared {
    ops: Mutex<Vec<Op>>,
    refuse: AtomicBool,
    conflicts: Mutex<HashSet<String>>,
    connection_open: AtomicBool,
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    subscriptions: Mutex<HashMap<String, Subscription>>,
    next_tag: AtomicU64,
    next_channel: AtomicUsize,
}

impl Shared {
    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }

    fn conflicting(&self, name: &str) -> bool {
        self.conflicts.lock().unwrap().contains(name)
    }
}

/// Recording transport; clones share state.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
}

impl MemoryTransport {
    pub fn new() -> MemoryTransport {
        MemoryTransport::default()
    }

    pub fn refuse_connections(&self) {
        self.shared.refuse.store(true, Ordering::SeqCst);
    }

    /// Declarations of `name` fail with a precondition error.
    pub fn conflict_on(&self, name: &str) {
        self.shared.conflicts.lock().unwrap().insert(name.to_owned());
    }

    pub fn ops(&self) -> Vec<Op> {
        self.shared.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.shared.ops.lock().unwrap().clear();
    }

    pub fn published(&self) -> Vec<(String, String, Vec<u8>, MessageProperties)> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Publish {
                    exchange,
                    routing_key,
                    payload,
                    properties,
                } => Some((exchange, routing_key, payload, properties)),
                _ => None,
            })
            .collect()
    }

    pub fn bound_keys(&self, queue: &str) -> Vec<String> {
        let mut keys = vec![];
        for op in self.ops() {
            match op {
                Op::Bind {
                    queue: q,
                    routing_key,
                    ..
                } if q == queue => {
                    if !keys.contains(&routing_key) {
                        keys.push(routing_key);
                    }
                }
                Op::Unbind {
                    queue: q,
                    routing_key,
                    ..
                } if q == queue => keys.retain(|k| k != &routing_key),
                _ => {}
            }
        }
        keys.sort();
        keys
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().unwrap().len()
    }

    /// Simulates the broker closing every open channel.
    pub fn close_channels(&self) {
        for channel in self.shared.channels.lock().unwrap().iter() {
            channel.active.store(false, Ordering::SeqCst);
        }
    }

    pub fn close_connection(&self) {
        self.shared.connection_open.store(false, Ordering::SeqCst);
    }

    /// Pushes a message to the subscriber of `queue`, returning its tag.
    pub fn deliver(
        &self,
        queue: &str,
        routing_key: &str,
        payload: &[u8],
        properties: MessageProperties,
    ) -> u64 {
        let delivery_tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst) + 1;
        let subscriptions = self.shared.subscriptions.lock().unwrap();
        let subscription = subscriptions
            .get(queue)
            .unwrap_or_else(|| panic!("nothing subscribed to {queue}"));

        subscription
            .sender
            .send(Delivery {
                delivery_info: DeliveryInfo {
                    delivery_tag,
                    routing_key: routing_key.to_owned(),
                    exchange: "burrow".to_owned(),
                    redelivered: false,
                    consumer_tag: subscription.consumer_tag.clone(),
                    context: subscription.context,
                    channel_generation: 0,
                },
                properties,
                payload: payload.to_vec(),
            })
            .unwrap();

        delivery_tag
    }

    /// Ends the delivery stream of `queue`.
    pub fn cancel(&self, queue: &str) {
        self.shared.subscriptions.lock().unwrap().remove(queue);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(
        &self,
        _params: &ConnectionParams,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        if self.shared.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionRefused(
                "Connection refused (os error 111)".to_owned(),
            ));
        }

        self.shared.record(Op::Connect);
        self.shared.connection_open.store(true, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    async fn create_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let id = self.shared.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.record(Op::CreateChannel {
            id,
            prefetch: options.prefetch,
            confirms: options.publisher_confirms,
        });

        let channel = Arc::new(MemoryChannel {
            id,
            shared: self.shared.clone(),
            active: AtomicBool::new(true),
            confirms: AtomicBool::new(options.publisher_confirms),
        });
        self.shared.channels.lock().unwrap().push(channel.clone());
        Ok(channel)
    }

    fn is_open(&self) -> bool {
        self.shared.connection_open.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.record(Op::CloseConnection);
        self.shared.connection_open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct MemoryChannel {
    id: usize,
    shared: Arc<Shared>,
    active: AtomicBool,
    confirms: AtomicBool,
}

impl MemoryChannel {
    fn check(&self) -> Result<(), TransportError> {
        if self.active.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::ChannelClosed(format!("channel {}", self.id)))
        }
    }

    fn precondition(&self, name: &str) -> Result<(), TransportError> {
        if self.shared.conflicting(name) {
            // the broker closes the channel after a 406
            self.active.store(false, Ordering::SeqCst);
            return Err(TransportError::PreconditionFailed(format!(
                "PRECONDITION_FAILED - inequivalent arg for '{name}'"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn using_publisher_confirmations(&self) -> bool {
        self.confirms.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.shared.record(Op::CloseChannel(self.id));
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        self.check()?;
        self.precondition(def.name())?;
        self.shared.record(Op::DeclareExchange {
            name: def.name().to_owned(),
            kind: def.exchange_kind().clone(),
            durable: def.is_durable(),
        });
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        self.check()?;
        self.precondition(def.name())?;
        self.shared.record(Op::DeclareQueue {
            name: def.name().to_owned(),
            durable: def.is_durable(),
            arguments: def.queue_arguments().clone(),
        });
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.check()?;
        self.shared.record(Op::Bind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.check()?;
        self.shared.record(Op::Unbind {
            queue: queue.to_owned(),
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        self.check()?;
        self.shared.record(Op::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            payload: payload.to_vec(),
            properties: properties.clone(),
        });
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.check()?;
        self.confirms.store(true, Ordering::SeqCst);
        self.shared.record(Op::ConfirmSelect);
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<(), TransportError> {
        self.check()?;
        self.shared.record(Op::WaitForConfirms);
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        self.check()?;
        self.shared.record(Op::Consume {
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
        });

        let (sender, receiver) = mpsc::unbounded_channel();
        self.shared.subscriptions.lock().unwrap().insert(
            queue.to_owned(),
            Subscription {
                sender,
                context: ContextId::current(),
                consumer_tag: consumer_tag.to_owned(),
            },
        );

        Ok(stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (Ok(delivery), receiver))
        })
        .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.check()?;
        self.shared.record(Op::Ack {
            channel: self.id,
            delivery_tag,
        });
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.check()?;
        self.shared.record(Op::Nack {
            channel: self.id,
            delivery_tag,
            requeue,
        });
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.check()?;
        self.shared.record(Op::Reject {
            channel: self.id,
            delivery_tag,
            requeue,
        });
        Ok(())
    }
}

/// Configuration used across unit tests; the HTTP API is off so nothing
/// tries to reach a management endpoint.
pub fn test_config() -> BrokerConfig {
    BrokerConfig {
        enable_http_api_use: false,
        graceful_exit_timeout: 1,
        ..BrokerConfig::default()
    }
}

/// Acknowledgement operations, without channel ids.
pub fn settlements(ops: &[Op]) -> Vec<Op> {
    ops.iter()
        .filter_map(|op| match op {
            Op::Ack { delivery_tag, .. } => Some(Op::Ack {
                channel: 0,
                delivery_tag: *delivery_tag,
            }),
            Op::Nack {
                delivery_tag,
                requeue,
                ..
            } => Some(Op::Nack {
                channel: 0,
                delivery_tag: *delivery_tag,
                requeue: *requeue,
            }),
            Op::Reject {
                delivery_tag,
                requeue,
                ..
            } => Some(Op::Reject {
                channel: 0,
                delivery_tag: *delivery_tag,
                requeue: *requeue,
            }),
            _ => None,
        })
        .collect()
}
