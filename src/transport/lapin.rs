// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Implements the transport traits on top of `lapin`. This is the only module
//! that knows about lapin's types: field tables, basic properties, option
//! structs and error kinds are all converted at this boundary.

use super::{
    ChannelOptions, Delivery, DeliveryStream, Transport, TransportChannel, TransportConnection,
    TransportError,
};
use crate::{
    config::ConnectionParams,
    context::ContextId,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::{DeliveryInfo, MessageProperties},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    tcp::OwnedTLSConfig,
    types::{AMQPValue, FieldArray, FieldTable, LongString, ShortString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use serde_json::{Map, Number, Value};
use std::{
    collections::BTreeMap,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::{debug, error, warn};

const PERSISTENT_DELIVERY_MODE: u8 = 2;
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Opens connections with lapin.
#[derive(Debug, Default, Clone, Copy)]
pub struct LapinTransport;

impl LapinTransport {
    pub fn new() -> Arc<LapinTransport> {
        Arc::new(LapinTransport)
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(
        &self,
        params: &ConnectionParams,
    ) -> Result<Arc<dyn TransportConnection>, TransportError> {
        debug!("creating amqp connection...");

        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(params.connection_name.clone()));

        let uri = amqp_uri(params);

        let connect = async {
            match &params.tls_ca_certificates {
                Some(path) => {
                    let cert_chain = tokio::fs::read_to_string(path).await.map_err(|err| {
                        TransportError::Other(format!(
                            "failure to read ca certificates `{}`: {}",
                            path.display(),
                            err
                        ))
                    })?;
                    let tls = OwnedTLSConfig {
                        cert_chain: Some(cert_chain),
                        ..OwnedTLSConfig::default()
                    };
                    Connection::connect_uri_with_config(uri, options, tls)
                        .await
                        .map_err(map_error)
                }
                None => Connection::connect_uri(uri, options).await.map_err(map_error),
            }
        };

        let conn = match tokio::time::timeout(params.connection_timeout, connect).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(err)) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(err);
            }
            Err(_) => {
                error!("timed out while connecting");
                return Err(TransportError::ConnectionRefused(format!(
                    "handshake did not complete within {:?}",
                    params.connection_timeout
                )));
            }
        };

        debug!("amqp connected");
        Ok(Arc::new(LapinConnection { inner: conn }))
    }
}

struct LapinConnection {
    inner: Connection,
}

#[async_trait]
impl TransportConnection for LapinConnection {
    async fn create_channel(
        &self,
        options: ChannelOptions,
    ) -> Result<Arc<dyn TransportChannel>, TransportError> {
        debug!("creating amqp channel...");

        let channel = self.inner.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            map_error(err)
        })?;

        if options.prefetch > 0 {
            channel
                .basic_qos(options.prefetch, BasicQosOptions { global: false })
                .await
                .map_err(map_error)?;
        }

        if options.publisher_confirms {
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await
                .map_err(map_error)?;
        }

        debug!("channel created");
        Ok(Arc::new(LapinChannel {
            inner: channel,
            confirms: AtomicBool::new(options.publisher_confirms),
        }))
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_open() {
            return Ok(());
        }
        self.inner.close(200, "bye").await.map_err(map_error)
    }
}

struct LapinChannel {
    inner: Channel,
    confirms: AtomicBool,
}

#[async_trait]
impl TransportChannel for LapinChannel {
    fn is_active(&self) -> bool {
        self.inner.status().connected()
    }

    fn using_publisher_confirmations(&self) -> bool {
        self.confirms.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if !self.is_active() {
            return Ok(());
        }
        self.inner.close(200, "bye").await.map_err(map_error)
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), TransportError> {
        self.inner
            .exchange_declare(
                &def.name,
                lapin_kind(&def.kind),
                ExchangeDeclareOptions {
                    durable: def.durable,
                    ..ExchangeDeclareOptions::default()
                },
                field_table(&def.params),
            )
            .await
            .map_err(map_error)
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), TransportError> {
        self.inner
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    durable: def.durable,
                    ..QueueDeclareOptions::default()
                },
                field_table(&def.arguments),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(map_error)
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.inner
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await
            .map_err(map_error)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &MessageProperties,
    ) -> Result<(), TransportError> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                payload,
                basic_properties(properties),
            )
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn confirm_select(&self) -> Result<(), TransportError> {
        self.inner
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await
            .map_err(map_error)?;
        self.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<(), TransportError> {
        let returned = self.inner.wait_for_confirms().await.map_err(map_error)?;
        if !returned.is_empty() {
            warn!(count = returned.len(), "broker returned unroutable messages");
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, TransportError> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                map_error(err)
            })?;

        let context = ContextId::current();
        let tag = consumer_tag.to_owned();

        Ok(consumer
            .map(move |result| {
                result.map_err(map_error).map(|delivery| Delivery {
                    delivery_info: DeliveryInfo {
                        delivery_tag: delivery.delivery_tag,
                        routing_key: delivery.routing_key.to_string(),
                        exchange: delivery.exchange.to_string(),
                        redelivered: delivery.redelivered,
                        consumer_tag: tag.clone(),
                        context,
                        channel_generation: 0,
                    },
                    properties: message_properties(&delivery.properties),
                    payload: delivery.data,
                })
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(map_error)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(map_error)
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError> {
        self.inner
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(map_error)
    }
}

/// Classifies lapin errors into the conditions the broker translates.
fn map_error(err: lapin::Error) -> TransportError {
    match &err {
        lapin::Error::IOError(io_err)
            if matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::TimedOut
            ) =>
        {
            TransportError::ConnectionRefused(err.to_string())
        }
        lapin::Error::ProtocolError(amqp_err)
            if matches!(
                amqp_err.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            TransportError::PreconditionFailed(err.to_string())
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            TransportError::ChannelClosed(err.to_string())
        }
        _ => TransportError::Other(err.to_string()),
    }
}

fn lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

/// `/` must be percent-encoded to survive as the URI path.
/// Built field by field so credentials and vhost never go through URI
/// escaping.
fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    AMQPUri {
        scheme: if params.tls {
            AMQPScheme::AMQPS
        } else {
            AMQPScheme::AMQP
        },
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.username.clone(),
                password: params.password.clone(),
            },
            host: params.host.clone(),
            port: params.port,
        },
        vhost: params.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(params.heartbeat),
            connection_timeout: Some(params.connection_timeout.as_millis() as u64),
            ..AMQPQueryString::default()
        },
    }
}

fn field_table(map: &BTreeMap<String, Value>) -> FieldTable {
    let mut table = BTreeMap::<ShortString, AMQPValue>::default();
    for (key, value) in map {
        table.insert(ShortString::from(key.clone()), amqp_value(value));
    }
    FieldTable::from(table)
}

fn amqp_value(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(b) => AMQPValue::Boolean(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => AMQPValue::LongLongInt(i),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s.clone())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(amqp_value).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = BTreeMap::<ShortString, AMQPValue>::default();
            for (key, value) in map {
                table.insert(ShortString::from(key.clone()), amqp_value(value));
            }
            AMQPValue::FieldTable(FieldTable::from(table))
        }
    }
}

fn json_value(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Boolean(b) => Value::Bool(*b),
        AMQPValue::ShortShortInt(i) => Value::from(*i),
        AMQPValue::ShortShortUInt(i) => Value::from(*i),
        AMQPValue::ShortInt(i) => Value::from(*i),
        AMQPValue::ShortUInt(i) => Value::from(*i),
        AMQPValue::LongInt(i) => Value::from(*i),
        AMQPValue::LongUInt(i) => Value::from(*i),
        AMQPValue::LongLongInt(i) => Value::from(*i),
        AMQPValue::Timestamp(t) => Value::from(*t),
        AMQPValue::Float(f) => Number::from_f64(f64::from(*f))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AMQPValue::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        AMQPValue::ShortString(s) => Value::String(s.to_string()),
        AMQPValue::LongString(s) => {
            Value::String(String::from_utf8_lossy(s.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(items) => {
            Value::Array(items.as_slice().iter().map(json_value).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.to_string(), json_value(v)))
                .collect::<Map<String, Value>>(),
        ),
        _ => Value::Null,
    }
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default().with_delivery_mode(
        if props.persistent.unwrap_or(false) {
            PERSISTENT_DELIVERY_MODE
        } else {
            TRANSIENT_DELIVERY_MODE
        },
    );

    if let Some(id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(id.clone()));
    }
    if let Some(timestamp) = props.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(encoding) = &props.content_encoding {
        basic = basic.with_content_encoding(ShortString::from(encoding.clone()));
    }
    if let Some(expiration) = &props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }
    if let Some(id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(id.clone()));
    }
    if let Some(reply_to) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(kind) = &props.kind {
        basic = basic.with_kind(ShortString::from(kind.clone()));
    }
    if let Some(app_id) = &props.app_id {
        basic = basic.with_app_id(ShortString::from(app_id.clone()));
    }
    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if !props.headers.is_empty() {
        basic = basic.with_headers(field_table(&props.headers));
    }

    basic
}

fn message_properties(props: &BasicProperties) -> MessageProperties {
    let short = |s: &Option<ShortString>| s.as_ref().map(ShortString::to_string);

    MessageProperties {
        routing_key: None,
        message_id: short(props.message_id()),
        timestamp: *props.timestamp(),
        content_type: short(props.content_type()),
        content_encoding: short(props.content_encoding()),
        persistent: props
            .delivery_mode()
            .map(|mode| mode == PERSISTENT_DELIVERY_MODE),
        expiration: short(props.expiration()),
        correlation_id: short(props.correlation_id()),
        reply_to: short(props.reply_to()),
        kind: short(props.kind()),
        app_id: short(props.app_id()),
        priority: *props.priority(),
        headers: props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(k, v)| (k.to_string(), json_value(v)))
                    .collect()
            })
            .unwrap_or_default(),
    }
}
