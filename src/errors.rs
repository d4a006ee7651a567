// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types
//!
//! `AmqpError` is the error returned by every broker, worker and publishing
//! operation. The first four variants are the conditions surfaced to users:
//! they are fatal when raised during startup, while `PublishError` raised at
//! runtime is an ordinary, recoverable return value.
//!
//! Consumer code fails with a [`HandlerError`], a boxed error that
//! acknowledgement strategies can downcast to decide what to do.

use thiserror::Error;

/// Error produced by consumer code while handling a message.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Represents errors that can occur while talking to the broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// The broker or the management API could not be reached
    #[error("connection error: {0}")]
    ConnectionError(String),

    /// The management API rejected the configured credentials
    #[error("authentication error: {0}")]
    AuthenticationError(String),

    /// An exchange or queue was redeclared with conflicting attributes
    #[error("worker setup error: {0}")]
    WorkerSetupError(String),

    /// Publishing was attempted without a usable connection or target
    #[error("publish error: {0}")]
    PublishError(String),

    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error creating or using a channel
    #[error("channel error: {0}")]
    ChannelError(String),

    /// Error declaring an exchange with the given name
    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    /// Error declaring a queue with the given name
    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    /// Error binding a queue to an exchange
    #[error("failure to bind exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    /// Error removing a queue binding
    #[error("failure to unbind exchange `{0}` from queue `{1}`")]
    UnbindingExchangeFromQueueError(String, String),

    /// Error declaring a consumer
    #[error("failure to declare consumer `{0}`")]
    ConsumerDeclarationError(String),

    /// The consumer tag does not satisfy the protocol constraints
    #[error("invalid consumer tag: {0}")]
    ConsumerTagError(String),

    /// Unexpected response from the management API
    #[error("management api error: {0}")]
    ManagementApiError(String),

    /// Invalid configuration value
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Error encoding or decoding a message body
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Consumer code panicked while handling a message
    #[error("consumer panicked: {0}")]
    ConsumerPanic(String),

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,

    /// Error rejecting or requeuing a message
    #[error("failure to requeuing message")]
    RequeuingMessageError,
}
