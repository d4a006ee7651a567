// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Execution Contexts
//!
//! AMQP channels must not be used concurrently from several execution
//! contexts. Every subscription loop runs inside its own [`ContextId`] scope
//! (a tokio task-local), and the broker keeps one channel per context.
//! Code running outside any scope belongs to [`ContextId::MAIN`].
//!
//! Acknowledgements requested from a context that does not own the delivery's
//! channel are parked in an [`ActionQueue`] and drained later by the owner.

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    future::Future,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::sync::Mutex;

tokio::task_local! {
    static CURRENT_CONTEXT: ContextId;
}

static NEXT_CONTEXT: AtomicU64 = AtomicU64::new(1);

/// Identity of the execution context that owns a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

impl ContextId {
    /// The coordination context: anything not running inside a scope.
    pub const MAIN: ContextId = ContextId(0);

    /// Allocates a fresh, never reused context id.
    pub fn next() -> ContextId {
        ContextId(NEXT_CONTEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The context of the calling task.
    pub fn current() -> ContextId {
        CURRENT_CONTEXT
            .try_with(|id| *id)
            .unwrap_or(ContextId::MAIN)
    }

    /// Runs `fut` with this id as the current context.
    pub async fn scope<F>(self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT_CONTEXT.scope(self, fut).await
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == ContextId::MAIN {
            write!(f, "main")
        } else {
            write!(f, "ctx-{}", self.0)
        }
    }
}

/// An acknowledgement that must run on the channel owning `delivery_tag`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingAction {
    Ack(u64),
    Nack(u64),
    Reject { delivery_tag: u64, requeue: bool },
}

/// Thread-safe per-context queue of parked acknowledgements, each with the
/// channel generation its delivery arrived on.
#[derive(Default)]
pub struct ActionQueue {
    pending: Mutex<HashMap<ContextId, VecDeque<(u64, PendingAction)>>>,
}

impl ActionQueue {
    pub fn new() -> ActionQueue {
        ActionQueue::default()
    }

    pub async fn push(&self, owner: ContextId, generation: u64, action: PendingAction) {
        self.pending
            .lock()
            .await
            .entry(owner)
            .or_default()
            .push_back((generation, action));
    }

    /// Removes and returns every action parked for `owner`, oldest first.
    pub async fn take(&self, owner: ContextId) -> Vec<(u64, PendingAction)> {
        self.pending
            .lock()
            .await
            .remove(&owner)
            .map(Vec::from)
            .unwrap_or_default()
    }

    pub async fn len(&self, owner: ContextId) -> usize {
        self.pending
            .lock()
            .await
            .get(&owner)
            .map(VecDeque::len)
            .unwrap_or_default()
    }
}
