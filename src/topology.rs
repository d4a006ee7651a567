// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Binding Topology
//!
//! This module keeps a queue's bindings on the main exchange in line with the
//! routing keys its consumer declares.
//!
//! With the management API available the reconciler removes bindings that are
//! no longer wanted before creating the desired ones. Without it, existing
//! bindings cannot be listed, so binding is additive only.

use crate::{
    errors::AmqpError,
    management::{BindingInfo, ManagementApi},
    transport::TransportChannel,
};
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Bindings to remove and to create for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BindingPlan {
    pub unbind: Vec<String>,
    pub bind: Vec<String>,
}

/// Groups the routing keys bound from `exchange` in `vhost` by destination
/// queue.
///
/// Bindings whose routing key equals the destination are the implicit
/// default-exchange bindings and are ignored.
pub fn group_bindings(
    bindings: Vec<BindingInfo>,
    exchange: &str,
    vhost: &str,
) -> HashMap<String, Vec<String>> {
    let mut grouped: HashMap<String, Vec<String>> = HashMap::new();

    for binding in bindings
        .into_iter()
        .filter(|b| b.destination != b.routing_key)
        .filter(|b| b.source == exchange && b.vhost == vhost)
    {
        grouped
            .entry(binding.destination)
            .or_default()
            .push(binding.routing_key);
    }

    grouped
}

/// Computes the operations turning `existing` into `desired`.
///
/// Every desired key is bound, whether or not it already exists; binding is
/// idempotent on the broker.
pub fn plan(existing: &[String], desired: &[String]) -> BindingPlan {
    let wanted: BTreeSet<&String> = desired.iter().collect();
    let unbind: Vec<String> = existing
        .iter()
        .filter(|key| !wanted.contains(key))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .cloned()
        .collect();

    let mut bind = vec![];
    for key in desired {
        if !bind.contains(key) {
            bind.push(key.clone());
        }
    }

    BindingPlan { unbind, bind }
}

/// Target of a reconciliation: the main exchange of one vhost.
#[derive(Debug, Clone, Copy)]
pub struct BindingTarget<'a> {
    pub exchange: &'a str,
    pub vhost: &'a str,
}

/// Makes the bindings of `queue` on the target exchange equal `routing_keys`.
///
/// Unbinding happens before binding, so a key that is both present and
/// desired is never dropped.
pub async fn reconcile(
    channel: &dyn TransportChannel,
    api: Option<&dyn ManagementApi>,
    target: BindingTarget<'_>,
    queue: &str,
    routing_keys: &[String],
) -> Result<(), AmqpError> {
    let existing = match api {
        Some(api) => {
            let mut grouped = group_bindings(api.bindings().await?, target.exchange, target.vhost);
            grouped.remove(queue).unwrap_or_default()
        }
        None => vec![],
    };

    let plan = plan(&existing, routing_keys);

    for key in &plan.unbind {
        debug!(queue, routing_key = key, "removing redundant binding");
        channel
            .unbind_queue(queue, target.exchange, key)
            .await
            .map_err(|_| {
                AmqpError::UnbindingExchangeFromQueueError(
                    target.exchange.to_owned(),
                    queue.to_owned(),
                )
            })?;
    }

    for key in &plan.bind {
        debug!(queue, routing_key = key, "creating binding");
        channel
            .bind_queue(queue, target.exchange, key)
            .await
            .map_err(|_| {
                AmqpError::BindingExchangeToQueueError(target.exchange.to_owned(), queue.to_owned())
            })?;
    }

    Ok(())
}
