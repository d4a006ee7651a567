// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumers
//!
//! A consumer processes the messages delivered to its queue. Each consumer is
//! registered through a [`ConsumerDescriptor`] carrying the routing keys it
//! binds, how its queue is named and declared, and a factory creating a fresh
//! instance for every delivery.

use crate::{
    acknowledgements::AckDecision,
    broker::Broker,
    errors::{AmqpError, HandlerError},
    message::{DeliveryInfo, Message},
    serializer::Serializer,
};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt,
    sync::{Arc, OnceLock},
};
use tracing::warn;

#[async_trait]
pub trait Consumer: Send + Sync {
    /// Handles one message. Returning an error hands the delivery to the
    /// acknowledgement strategies and the error handlers.
    async fn process(&self, ctx: &ConsumerContext, message: &Message) -> Result<(), HandlerError>;
}

/// Gives a consumer control over its own delivery.
///
/// Only the first settlement is issued; when the consumer settled the
/// delivery itself the dispatcher leaves it alone.
pub struct ConsumerContext {
    broker: Arc<Broker>,
    delivery_info: DeliveryInfo,
    settled: OnceLock<AckDecision>,
}

impl ConsumerContext {
    pub(crate) fn new(broker: Arc<Broker>, delivery_info: DeliveryInfo) -> ConsumerContext {
        ConsumerContext {
            broker,
            delivery_info,
            settled: OnceLock::new(),
        }
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    pub fn delivery_info(&self) -> &DeliveryInfo {
        &self.delivery_info
    }

    pub async fn ack(&self) -> Result<(), AmqpError> {
        if self.claim(AckDecision::Ack) {
            self.broker.ack(&self.delivery_info).await?;
        }
        Ok(())
    }

    /// Rejects the delivery without requeue.
    pub async fn reject(&self) -> Result<(), AmqpError> {
        if self.claim(AckDecision::Nack) {
            self.broker.reject(&self.delivery_info, false).await?;
        }
        Ok(())
    }

    pub async fn requeue(&self) -> Result<(), AmqpError> {
        if self.claim(AckDecision::Requeue) {
            self.broker.requeue(&self.delivery_info).await?;
        }
        Ok(())
    }

    /// How the delivery was settled, if it was.
    pub fn decision(&self) -> Option<AckDecision> {
        self.settled.get().copied()
    }

    fn claim(&self, decision: AckDecision) -> bool {
        match self.settled.set(decision) {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    delivery_tag = self.delivery_info.delivery_tag,
                    requested = %decision,
                    settled = ?self.decision(),
                    "delivery already settled, ignoring"
                );
                false
            }
        }
    }
}

type ConsumerFactory = Arc<dyn Fn() -> Box<dyn Consumer> + Send + Sync>;

/// Registration data of one consumer.
#[derive(Clone)]
pub struct ConsumerDescriptor {
    name: String,
    factory: ConsumerFactory,
    routing_keys: Vec<String>,
    queue_name: Option<String>,
    queue_namespace: Option<String>,
    arguments: BTreeMap<String, Value>,
    serializer: Option<Arc<dyn Serializer>>,
    group: Option<String>,
}

impl ConsumerDescriptor {
    /// Describes `C`, named after its type path.
    pub fn new<C>() -> ConsumerDescriptor
    where
        C: Consumer + Default + 'static,
    {
        Self::with_factory(std::any::type_name::<C>(), || Box::new(C::default()))
    }

    pub fn with_factory<F>(name: impl Into<String>, factory: F) -> ConsumerDescriptor
    where
        F: Fn() -> Box<dyn Consumer> + Send + Sync + 'static,
    {
        ConsumerDescriptor {
            name: name.into(),
            factory: Arc::new(factory),
            routing_keys: Vec::new(),
            queue_name: None,
            queue_namespace: None,
            arguments: BTreeMap::new(),
            serializer: None,
            group: None,
        }
    }

    /// Adds routing keys to bind; duplicates are ignored.
    pub fn consume<I, S>(mut self, routing_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for key in routing_keys {
            let key = key.into();
            if !self.routing_keys.contains(&key) {
                self.routing_keys.push(key);
            }
        }
        self
    }

    /// Overrides the derived queue name.
    pub fn queue_name(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    /// Prefixes the derived queue name; lower-cased and stripped of
    /// anything but word characters.
    pub fn queue_namespace(mut self, namespace: &str) -> Self {
        let namespace: String = namespace
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '_')
            .collect();
        self.queue_namespace = Some(namespace);
        self
    }

    /// Extra `x-` arguments for the queue declaration.
    pub fn arguments(mut self, arguments: BTreeMap<String, Value>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routing_keys(&self) -> &[String] {
        &self.routing_keys
    }

    pub fn get_arguments(&self) -> &BTreeMap<String, Value> {
        &self.arguments
    }

    pub fn get_serializer(&self) -> Option<&Arc<dyn Serializer>> {
        self.serializer.as_ref()
    }

    pub fn get_group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// `Shop::OrderCreated` becomes `shop:order_created`.
    pub fn get_queue_name(&self) -> String {
        if let Some(name) = &self.queue_name {
            return name.clone();
        }

        let path = self.name.replace("::", ":");
        let mut queue_name = String::with_capacity(path.len() + 8);
        let mut previous: Option<char> = None;
        for c in path.chars() {
            if c.is_ascii_uppercase() {
                if let Some(p) = previous {
                    if !p.is_ascii_uppercase() && p != ':' {
                        queue_name.push('_');
                    }
                }
            }
            queue_name.push(c);
            previous = Some(c);
        }
        let queue_name = queue_name.to_lowercase();

        match self.queue_namespace.as_deref() {
            Some(namespace) if !namespace.is_empty() => format!("{namespace}:{queue_name}"),
            _ => queue_name,
        }
    }

    pub(crate) fn instantiate(&self) -> Box<dyn Consumer> {
        (self.factory)()
    }
}

impl fmt::Debug for ConsumerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerDescriptor")
            .field("name", &self.name)
            .field("routing_keys", &self.routing_keys)
            .field("queue_name", &self.get_queue_name())
            .field("group", &self.group)
            .finish()
    }
}

/// Consumers known to a worker, in registration order.
#[derive(Debug, Clone, Default)]
pub struct ConsumerRegistry {
    consumers: Vec<ConsumerDescriptor>,
}

impl ConsumerRegistry {
    pub fn new() -> ConsumerRegistry {
        ConsumerRegistry::default()
    }

    pub fn register(&mut self, descriptor: ConsumerDescriptor) {
        self.consumers.push(descriptor);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConsumerDescriptor> {
        self.consumers.iter()
    }

    pub fn len(&self) -> usize {
        self.consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consumers.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::ConnectOptions,
        context::ContextId,
        queue::AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        serializer::IdentitySerializer,
        test_support::{settlements, test_config, MemoryTransport, Op},
    };
    use serde_json::json;

    #[derive(Default)]
    pub(crate) struct Noop;

    #[async_trait]
    impl Consumer for Noop {
        async fn process(&self, _: &ConsumerContext, _: &Message) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn named(name: &str) -> ConsumerDescriptor {
        ConsumerDescriptor::with_factory(name, || Box::new(Noop))
    }

    #[test]
    fn queue_name_is_snake_cased_with_colon_separators() {
        assert_eq!(named("Foo::BarBaz").get_queue_name(), "foo:bar_baz");
        assert_eq!(named("Billing::HTTPCallback").get_queue_name(), "billing:httpcallback");
        assert_eq!(named("orders::PaymentV2Done").get_queue_name(), "orders:payment_v2_done");
    }

    #[test]
    fn queue_namespace_is_sanitized_and_prefixed() {
        let descriptor = named("Foo::BarBaz").queue_namespace("Web-App:1");
        assert_eq!(descriptor.get_queue_name(), "webapp1:foo:bar_baz");
    }

    #[test]
    fn explicit_queue_name_wins() {
        let descriptor = named("Foo::BarBaz")
            .queue_namespace("app")
            .queue_name("custom");
        assert_eq!(descriptor.get_queue_name(), "custom");
    }

    #[test]
    fn typed_descriptors_use_the_type_path() {
        let descriptor = ConsumerDescriptor::new::<Noop>();
        assert_eq!(descriptor.name(), "burrow::consumer::tests::Noop");
        assert_eq!(descriptor.get_queue_name(), "burrow:consumer:tests:noop");
    }

    #[test]
    fn routing_keys_are_a_set() {
        let descriptor = named("Foo")
            .consume(["a.b", "c.d"])
            .consume(["a.b", "e.f"]);
        assert_eq!(descriptor.routing_keys(), ["a.b", "c.d", "e.f"]);
    }

    #[test]
    fn builders_keep_declaration_details() {
        let mut arguments = BTreeMap::new();
        arguments.insert(AMQP_HEADERS_DEAD_LETTER_EXCHANGE.to_owned(), json!("dlx"));

        let descriptor = named("Foo")
            .arguments(arguments)
            .serializer(Arc::new(IdentitySerializer))
            .group("billing");

        assert_eq!(
            descriptor.get_arguments().get(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            Some(&json!("dlx"))
        );
        assert!(descriptor.get_serializer().is_some());
        assert_eq!(descriptor.get_group(), Some("billing"));
    }

    #[test]
    fn registry_keeps_registration_order() {
        let mut registry = ConsumerRegistry::new();
        registry.register(named("A"));
        registry.register(named("B"));

        let names: Vec<&str> = registry.iter().map(ConsumerDescriptor::name).collect();
        assert_eq!(names, ["A", "B"]);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn context_settles_a_delivery_once() {
        let transport = MemoryTransport::new();
        let broker = Arc::new(Broker::new(test_config(), Arc::new(transport.clone())).unwrap());
        broker.connect(ConnectOptions::default()).await.unwrap();

        let ctx = ConsumerContext::new(
            broker,
            DeliveryInfo {
                delivery_tag: 4,
                routing_key: "k".into(),
                exchange: "burrow".into(),
                redelivered: false,
                consumer_tag: "t".into(),
                context: ContextId::MAIN,
                channel_generation: 0,
            },
        );

        ctx.requeue().await.unwrap();
        ctx.ack().await.unwrap();

        assert_eq!(ctx.decision(), Some(AckDecision::Requeue));
        assert_eq!(
            settlements(&transport.ops()),
            vec![Op::Reject {
                channel: 0,
                delivery_tag: 4,
                requeue: true
            }]
        );
    }
}
