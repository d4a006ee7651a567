// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Tasks running subscription loops, with graceful shutdown.

use std::{
    future::Future,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};
use tokio::{
    sync::{watch, Mutex},
    task::JoinSet,
};
use tracing::{error, info, warn};

pub struct WorkPool {
    shutdown: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
    grace: Duration,
    abandoned: AtomicBool,
}

impl WorkPool {
    pub fn new(grace: Duration) -> WorkPool {
        let (shutdown, _) = watch::channel(false);

        WorkPool {
            shutdown,
            tasks: Mutex::new(JoinSet::new()),
            grace,
            abandoned: AtomicBool::new(false),
        }
    }

    /// Flips to `true` once [`WorkPool::stop`] was called; loops stop taking
    /// new deliveries when it does.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub fn is_stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Records that a subscription ended for good; the worker stops once it
    /// notices.
    pub fn abandon(&self, reason: &str) {
        error!(reason, "subscription abandoned");
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    pub async fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.lock().await.spawn(task);
    }

    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Stops intake, gives in-flight work the grace period to finish, then
    /// aborts whatever is left.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);

        let mut tasks = self.tasks.lock().await;
        if tasks.is_empty() {
            return;
        }

        info!(
            tasks = tasks.len(),
            grace = ?self.grace,
            "waiting for in-flight deliveries"
        );

        let drained = tokio::time::timeout(self.grace, async {
            while let Some(joined) = tasks.join_next().await {
                if let Err(err) = joined {
                    if err.is_panic() {
                        error!(error = err.to_string(), "subscription task panicked");
                    }
                }
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                "graceful exit timeout reached, killing consumer work"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn stop_waits_for_tasks_watching_the_signal() {
        let pool = WorkPool::new(Duration::from_secs(5));
        let finished = Arc::new(AtomicBool::new(false));

        let mut signal = pool.shutdown_signal();
        let flag = finished.clone();
        pool.spawn(async move {
            let _ = signal.wait_for(|stop| *stop).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        pool.stop().await;

        assert!(pool.is_stopping());
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(pool.len().await, 0);
    }

    #[tokio::test]
    async fn stop_aborts_work_outliving_the_grace_period() {
        let pool = WorkPool::new(Duration::from_millis(50));
        let finished = Arc::new(AtomicBool::new(false));

        let flag = finished.clone();
        pool.spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            flag.store(true, Ordering::SeqCst);
        })
        .await;

        pool.stop().await;

        assert!(!finished.load(Ordering::SeqCst));
        assert_eq!(pool.len().await, 0);
    }

    #[test]
    fn abandoning_is_sticky() {
        let pool = WorkPool::new(Duration::from_secs(1));
        assert!(!pool.is_abandoned());

        pool.abandon("delivery stream ended");
        pool.abandon("again");

        assert!(pool.is_abandoned());
        assert!(!pool.is_stopping());
    }
}
