// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Decorators run around every consumer invocation.

use crate::{consumer::ConsumerDescriptor, errors::HandlerError, message::Message};
use async_trait::async_trait;
use futures_util::future::BoxFuture;

#[async_trait]
pub trait Tracer: Send + Sync {
    /// Awaits `call`, the consumer invocation for `message`, returning its
    /// outcome unchanged.
    async fn trace(
        &self,
        descriptor: &ConsumerDescriptor,
        message: &Message,
        call: BoxFuture<'_, Result<(), HandlerError>>,
    ) -> Result<(), HandlerError>;
}

/// Runs the consumer without tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTracer;

#[async_trait]
impl Tracer for NullTracer {
    async fn trace(
        &self,
        _descriptor: &ConsumerDescriptor,
        _message: &Message,
        call: BoxFuture<'_, Result<(), HandlerError>>,
    ) -> Result<(), HandlerError> {
        call.await
    }
}
