use crate::config::ServerConfig;
use crate::feed::Feed;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use vigil_alert::{AlertEngine, EngineConfig};
use vigil_notify::channels::email::EmailChannel;
use vigil_notify::channels::http::HttpTransport;
use vigil_notify::channels::url::UrlChannel;
use vigil_notify::dispatcher::Dispatcher;
use vigil_notify::queue::NotificationQueue;
use vigil_notify::{NotificationChannel, NotificationSink};
use vigil_storage::{HistoryStore, Store, UserSettingsStore};

/// Builds the dispatcher with HTTP delivery and, when `[smtp]` is set,
/// mail delivery.
pub fn build_dispatcher(
    config: &ServerConfig,
    settings: Arc<dyn UserSettingsStore>,
) -> Result<Dispatcher> {
    let email: Option<Box<dyn NotificationChannel>> = match &config.smtp {
        Some(smtp) => {
            tracing::info!(host = %smtp.host, port = smtp.port, "Mail delivery enabled");
            Some(Box::new(EmailChannel::new(smtp)?))
        }
        None => {
            tracing::info!("SMTP not configured, mail delivery disabled");
            None
        }
    };
    let urls = UrlChannel::new(Box::new(HttpTransport::new()));
    Ok(Dispatcher::new(settings, urls, email, &config.app_url))
}

/// Deletes solved history entries older than `retention_days`.
pub fn purge_history(store: &dyn HistoryStore, retention_days: u32, now: DateTime<Utc>) -> Result<usize> {
    let cutoff = now - chrono::Duration::days(i64::from(retention_days));
    store.delete_solved_before(cutoff)
}

async fn run_history_cleanup(
    store: Arc<dyn HistoryStore>,
    retention_days: u32,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(Duration::from_secs(3600)); // Every hour
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match purge_history(store.as_ref(), retention_days, Utc::now()) {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "Purged solved alert history")
                    }
                    Err(e) => tracing::error!(error = %e, "History cleanup failed"),
                    _ => {}
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// Background tasks of a running server.
pub struct Runtime {
    shutdown: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    queue: NotificationQueue,
}

impl Runtime {
    /// Starts the notification workers, the alert engine with its
    /// schedulers, the snapshot feed and the history cleanup.
    pub async fn start<S: Store + 'static>(
        config: &ServerConfig,
        store: Arc<S>,
        dispatcher: Dispatcher,
    ) -> Result<Self> {
        let alerts = &config.alerts;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let queue = NotificationQueue::start(
            Arc::new(dispatcher),
            alerts.notify_workers,
            alerts.notify_queue_capacity,
        );
        let sink: Arc<dyn NotificationSink> = Arc::new(queue.notifier());

        let engine_config = EngineConfig {
            app_url: config.app_url.clone(),
            status_scan_interval: alerts.status_scan_interval(),
        };
        let (engine, status_worker) =
            AlertEngine::start(store.clone(), sink, engine_config, shutdown_rx.clone());
        let engine = Arc::new(engine);
        let mut tasks = vec![("status debounce", status_worker)];

        if let Err(e) = engine.reconcile(Utc::now()).await {
            tracing::error!(error = %e, "Status reconciliation failed");
        }

        let repeat = engine.repeat_scheduler();
        tasks.push((
            "repeat scheduler",
            tokio::spawn(repeat.run(alerts.repeat_tick_interval(), shutdown_rx.clone())),
        ));

        let feed_store: Arc<dyn Store> = store.clone();
        let feed = Feed::new(feed_store, engine)?;
        tasks.push((
            "snapshot feed",
            tokio::spawn(feed.run(alerts.snapshot_poll_interval(), shutdown_rx.clone())),
        ));

        let history: Arc<dyn HistoryStore> = store;
        tasks.push((
            "history cleanup",
            tokio::spawn(run_history_cleanup(
                history,
                config.history_retention_days,
                shutdown_rx,
            )),
        ));

        tracing::info!(tasks = tasks.len(), "Alert runtime started");
        Ok(Self {
            shutdown: shutdown_tx,
            tasks,
            queue,
        })
    }

    /// Stops every background task, then drains queued notifications.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, handle) in self.tasks {
            if let Err(e) = handle.await {
                tracing::error!(task = name, error = %e, "Background task panicked");
            }
        }
        self.queue.shutdown().await;
        tracing::info!("Alert runtime stopped");
    }
}
