// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Handlers
//!
//! Reporters notified of every consumer failure. Unlike acknowledgement
//! strategies every handler runs, and a failing or panicking handler never
//! affects dispatch or the handlers after it.

use crate::{
    consumer::ConsumerDescriptor,
    errors::{AmqpError, HandlerError},
    message::{DeliveryInfo, MessageProperties},
};
use async_trait::async_trait;
use futures_util::FutureExt;
use std::{error::Error, fmt, panic::AssertUnwindSafe, sync::Arc};
use tracing::error;

#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(
        &self,
        properties: &MessageProperties,
        payload: &[u8],
        consumer: &ConsumerDescriptor,
        err: &HandlerError,
    ) -> Result<(), HandlerError>;

    /// Entry point used by the dispatcher. Override it to also receive the
    /// delivery info; the default forwards to [`ErrorHandler::handle`].
    async fn handle_with_delivery(
        &self,
        _delivery_info: &DeliveryInfo,
        properties: &MessageProperties,
        payload: &[u8],
        consumer: &ConsumerDescriptor,
        err: &HandlerError,
    ) -> Result<(), HandlerError> {
        self.handle(properties, payload, consumer, err).await
    }

    /// Called when queue setup fails at worker start.
    async fn handle_setup_error(&self, _err: &AmqpError) -> Result<(), HandlerError> {
        Ok(())
    }
}

/// Logs failures with the error's source chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggerErrorHandler;

#[async_trait]
impl ErrorHandler for LoggerErrorHandler {
    async fn handle(
        &self,
        properties: &MessageProperties,
        _payload: &[u8],
        consumer: &ConsumerDescriptor,
        err: &HandlerError,
    ) -> Result<(), HandlerError> {
        let message_id = properties.message_id.as_deref().unwrap_or("-");

        error!(
            message_id,
            consumer = consumer.name(),
            "error in consumer"
        );
        error!(message_id, error = err.to_string(), "{}", error_chain(err.as_ref()));
        Ok(())
    }

    async fn handle_setup_error(&self, err: &AmqpError) -> Result<(), HandlerError> {
        error!(error = err.to_string(), "error during worker setup");
        Ok(())
    }
}

fn error_chain(err: &(dyn Error + 'static)) -> String {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(format!("caused by: {cause}"));
        source = cause.source();
    }
    chain.join("\n")
}

/// Broadcasts a failure to every registered handler.
#[derive(Clone)]
pub struct ErrorHandlerChain {
    handlers: Vec<Arc<dyn ErrorHandler>>,
}

impl Default for ErrorHandlerChain {
    fn default() -> Self {
        ErrorHandlerChain {
            handlers: vec![Arc::new(LoggerErrorHandler)],
        }
    }
}

impl ErrorHandlerChain {
    /// A chain holding only the logging handler.
    pub fn new() -> ErrorHandlerChain {
        ErrorHandlerChain::default()
    }

    pub fn push(&mut self, handler: Arc<dyn ErrorHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn notify(
        &self,
        delivery_info: &DeliveryInfo,
        properties: &MessageProperties,
        payload: &[u8],
        consumer: &ConsumerDescriptor,
        err: &HandlerError,
    ) {
        for handler in &self.handlers {
            let outcome = AssertUnwindSafe(handler.handle_with_delivery(
                delivery_info,
                properties,
                payload,
                consumer,
                err,
            ))
            .catch_unwind()
            .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(handler_err)) => {
                    error!(error = handler_err.to_string(), "error handler failed")
                }
                Err(_) => error!("error handler panicked"),
            }
        }
    }

    pub async fn notify_setup(&self, err: &AmqpError) {
        for handler in &self.handlers {
            let outcome = AssertUnwindSafe(handler.handle_setup_error(err))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(handler_err)) => {
                    error!(error = handler_err.to_string(), "error handler failed")
                }
                Err(_) => error!("error handler panicked"),
            }
        }
    }
}

impl fmt::Debug for ErrorHandlerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlerChain")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
