// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;

#[cfg(test)]
mod test_support;

pub mod acknowledgements;
pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod context;
pub mod dispatcher;
pub mod error_handlers;
pub mod errors;
pub mod exchange;
pub mod management;
pub mod message;
pub mod pool;
pub mod publisher;
pub mod queue;
pub mod serializer;
pub mod topology;
pub mod tracer;
pub mod transport;
pub mod wait_exchange;
pub mod waiter;
pub mod worker;

pub use otel::{new_span, OtelTracer};
