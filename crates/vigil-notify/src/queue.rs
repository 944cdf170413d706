//! Bounded notification queue drained by a fixed pool of delivery workers.

use crate::dispatcher::Dispatcher;
use crate::NotificationSink;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use vigil_common::types::Notification;

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_WORKERS: usize = 4;

/// Owner of the worker pool. Hand [`Notifier`]s to producers and call
/// [`NotificationQueue::shutdown`] to drain and stop.
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl NotificationQueue {
    /// Spawns `workers` delivery tasks on the current runtime.
    pub fn start(dispatcher: Arc<Dispatcher>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..workers.max(1))
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    dispatcher.clone(),
                    rx.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        Self {
            tx,
            shutdown_tx,
            workers,
        }
    }

    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.tx.clone(),
        }
    }

    /// Stops accepting work, delivers what is already queued and waits for
    /// every worker to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        drop(self.tx);
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Notification worker panicked");
            }
        }
        tracing::info!("Notification queue drained");
    }
}

async fn run_worker(
    worker: usize,
    dispatcher: Arc<Dispatcher>,
    rx: Arc<Mutex<mpsc::Receiver<Notification>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut closing = *shutdown.borrow();
    loop {
        let job = {
            let mut rx = rx.lock().await;
            if closing {
                rx.close();
                rx.recv().await
            } else {
                let next = tokio::select! {
                    job = rx.recv() => Some(job),
                    _ = shutdown.changed() => None,
                };
                match next {
                    Some(job) => job,
                    None => {
                        closing = true;
                        continue;
                    }
                }
            }
        };

        let Some(notification) = job else {
            break;
        };
        if let Err(e) = dispatcher.send(&notification).await {
            tracing::error!(
                worker,
                user_id = %notification.user_id,
                error = %e,
                "Notification dispatch failed"
            );
        }
    }
    tracing::debug!(worker, "Notification worker stopped");
}

/// Cheap handle used by the alert engine to enqueue notifications.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl NotificationSink for Notifier {
    fn notify(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => tracing::warn!(
                user_id = %n.user_id,
                title = %n.title,
                "Notification queue full, dropping notification"
            ),
            Err(TrySendError::Closed(n)) => tracing::warn!(
                user_id = %n.user_id,
                title = %n.title,
                "Notification queue closed, dropping notification"
            ),
        }
    }
}
