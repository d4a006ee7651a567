// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Signal Waiter
//!
//! QUIT, TERM and INT stop the worker; USR2 logs the state of the connection
//! and of every context's channel, then waiting resumes.
//!
//! Listeners only forward what they receive into a queue. The wait loop reads
//! it on a short tick so the main context's queued acknowledgements get
//! drained in between. A subscription given up by the work pool ends the wait
//! as if TERM had arrived.

use crate::{broker::Broker, errors::AmqpError};
use std::{fmt, time::Duration};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Quit,
    Terminate,
    Interrupt,
    User2,
}

impl Signal {
    /// Whether the signal stops the worker.
    pub fn is_shutdown(self) -> bool {
        !matches!(self, Signal::User2)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signal::Quit => f.write_str("QUIT"),
            Signal::Terminate => f.write_str("TERM"),
            Signal::Interrupt => f.write_str("INT"),
            Signal::User2 => f.write_str("USR2"),
        }
    }
}

pub struct Waiter {
    signals: mpsc::UnboundedReceiver<Signal>,
}

impl Waiter {
    /// Registers the process signal listeners. Must be called from within a
    /// tokio runtime.
    #[cfg(unix)]
    pub fn install() -> Result<Waiter, AmqpError> {
        use tokio::signal::unix::{signal, SignalKind};

        let (sender, receiver) = mpsc::unbounded_channel();

        for (kind, forwarded) in [
            (SignalKind::quit(), Signal::Quit),
            (SignalKind::terminate(), Signal::Terminate),
            (SignalKind::interrupt(), Signal::Interrupt),
            (SignalKind::user_defined2(), Signal::User2),
        ] {
            let mut listener = signal(kind).map_err(|err| {
                AmqpError::WorkerSetupError(format!(
                    "couldn't listen for SIG{forwarded}: {err}"
                ))
            })?;

            let sender = sender.clone();
            tokio::spawn(async move {
                while listener.recv().await.is_some() {
                    if sender.send(forwarded).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Waiter::from_receiver(receiver))
    }

    #[cfg(not(unix))]
    pub fn install() -> Result<Waiter, AmqpError> {
        let (sender, receiver) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if sender.send(Signal::Interrupt).is_err() {
                    break;
                }
            }
        });

        Ok(Waiter::from_receiver(receiver))
    }

    /// A waiter fed by something other than process signals.
    pub fn from_receiver(signals: mpsc::UnboundedReceiver<Signal>) -> Waiter {
        Waiter { signals }
    }

    /// Blocks until a shutdown signal arrives and returns it.
    pub async fn wait_until_signaled(&mut self, broker: &Broker) -> Signal {
        loop {
            if broker.work_pool().is_abandoned() {
                error!("a subscription was lost for good, stopping");
                return Signal::Terminate;
            }

            match tokio::time::timeout(POLL_INTERVAL, self.signals.recv()).await {
                Ok(Some(signal)) if signal.is_shutdown() => {
                    info!("caught SIG{signal}, stopping");
                    return signal;
                }
                Ok(Some(signal)) => log_diagnostics(signal, broker).await,
                Ok(None) => {
                    warn!("signal listeners are gone, stopping");
                    return Signal::Terminate;
                }
                Err(_) => {}
            }

            broker.drain_pending_actions().await;
        }
    }
}

async fn log_diagnostics(signal: Signal, broker: &Broker) {
    info!("caught SIG{signal}, dumping worker state");
    let state = broker.state().await;
    info!(?state, "connection");

    for channel in broker.describe_channels().await {
        info!(
            context = %channel.context,
            active = channel.active,
            "channel"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConnectOptions,
        context::ContextId,
        message::DeliveryInfo,
        test_support::{settlements, test_config, MemoryTransport, Op},
    };
    use std::sync::Arc;

    async fn connected(transport: &MemoryTransport) -> Broker {
        let broker = Broker::new(test_config(), Arc::new(transport.clone())).unwrap();
        broker.connect(ConnectOptions::default()).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn user_signals_do_not_stop_waiting() {
        let transport = MemoryTransport::new();
        let broker = connected(&transport).await;
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut waiter = Waiter::from_receiver(receiver);

        sender.send(Signal::User2).unwrap();
        sender.send(Signal::Terminate).unwrap();

        assert_eq!(waiter.wait_until_signaled(&broker).await, Signal::Terminate);
    }

    #[tokio::test]
    async fn closed_signal_queue_stops_waiting() {
        let transport = MemoryTransport::new();
        let broker = connected(&transport).await;
        let (sender, receiver) = mpsc::unbounded_channel::<Signal>();
        drop(sender);

        let mut waiter = Waiter::from_receiver(receiver);

        assert_eq!(waiter.wait_until_signaled(&broker).await, Signal::Terminate);
    }

    #[tokio::test]
    async fn abandoned_subscriptions_stop_waiting() {
        let transport = MemoryTransport::new();
        let broker = connected(&transport).await;
        let (_sender, receiver) = mpsc::unbounded_channel();
        let mut waiter = Waiter::from_receiver(receiver);

        broker.work_pool().abandon("delivery stream ended");

        let signal = tokio::time::timeout(
            Duration::from_secs(5),
            waiter.wait_until_signaled(&broker),
        )
        .await
        .unwrap();
        assert_eq!(signal, Signal::Terminate);
    }

    #[tokio::test]
    async fn waiting_drains_main_context_acknowledgements() {
        let transport = MemoryTransport::new();
        let broker = Arc::new(connected(&transport).await);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut waiter = Waiter::from_receiver(receiver);

        let delivery = DeliveryInfo {
            delivery_tag: 7,
            routing_key: "k".into(),
            exchange: "burrow".into(),
            redelivered: false,
            consumer_tag: "t".into(),
            context: ContextId::MAIN,
            channel_generation: 0,
        };
        let other = broker.clone();
        ContextId::next()
            .scope(async move { other.ack(&delivery).await.unwrap() })
            .await;
        assert!(settlements(&transport.ops()).is_empty());

        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            sender.send(Signal::Quit).unwrap();
        });

        assert_eq!(waiter.wait_until_signaled(&broker).await, Signal::Quit);
        stopper.await.unwrap();

        assert_eq!(
            settlements(&transport.ops()),
            vec![Op::Ack { channel: 0, delivery_tag: 7 }]
        );
    }

    #[test]
    fn only_user2_keeps_the_worker_running() {
        assert!(Signal::Quit.is_shutdown());
        assert!(Signal::Terminate.is_shutdown());
        assert!(Signal::Interrupt.is_shutdown());
        assert!(!Signal::User2.is_shutdown());
        assert_eq!(Signal::Terminate.to_string(), "TERM");
    }
}
