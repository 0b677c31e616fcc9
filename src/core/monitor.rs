//! Wires the stream client, registry, initiator and notifier together.
//!
//! Stream listeners only forward events into a channel; one consumer task
//! applies them, so push-derived merges have a single writer. A second task
//! pulls `GET /jobs/active` on a fixed interval as a safety net for missed
//! or out-of-order push events. Running jobs that drop off the active list
//! are looked up in their client's history.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::initiator::{BackupInitiator, StartedBackup};
use super::models::{BackupFinished, JobId, JobStatus};
use super::notifier::ProgressNotifier;
use super::registry::JobRegistry;
use crate::api::BackupApi;
use crate::config::AppConfig;
use crate::error::StartError;
use crate::logging::LogThrottle;
use crate::stream::{EventKind, EventStreamClient, StreamEvent};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Everything the event consumer and poll loop need, cheap to clone into tasks.
#[derive(Clone)]
struct Handler {
    stream: EventStreamClient,
    registry: JobRegistry,
    initiator: Arc<BackupInitiator>,
    notifier: ProgressNotifier,
    progress_log: Arc<LogThrottle<JobId>>,
}

pub struct Monitor {
    handler: Handler,
    poll_interval: Duration,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Monitor {
    pub fn new(api: Arc<dyn BackupApi>, stream: EventStreamClient, config: &AppConfig) -> Self {
        let registry = JobRegistry::new(
            api.clone(),
            config.refresh_debounce(),
            config.history_limit,
        );
        let initiator = Arc::new(BackupInitiator::new(api, registry.clone()));

        Self {
            handler: Handler {
                stream,
                registry,
                initiator,
                notifier: ProgressNotifier::new(),
                progress_log: Arc::new(LogThrottle::new(PROGRESS_LOG_INTERVAL)),
            },
            poll_interval: config.poll_interval(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.handler.registry
    }

    pub fn initiator(&self) -> &BackupInitiator {
        &self.handler.initiator
    }

    pub fn notifier(&self) -> &ProgressNotifier {
        &self.handler.notifier
    }

    pub fn stream(&self) -> &EventStreamClient {
        &self.handler.stream
    }

    /// Subscribe to the stream, spawn the consumer and poll loops, then
    /// connect. Returns whether the push channel is open; polling runs either way.
    pub async fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return self.handler.stream.is_connected();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        for kind in EventKind::ALL {
            let tx = tx.clone();
            self.handler.stream.on(kind, move |event| {
                let _ = tx.send(event.clone());
            });
        }

        let consumer = tokio::spawn(consume(self.handler.clone(), rx, self.cancel.clone()));
        let poller = tokio::spawn(poll(
            self.handler.clone(),
            self.poll_interval,
            self.cancel.clone(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([consumer, poller]);

        let connected = self.handler.stream.connect().await;
        if !connected {
            warn!(
                endpoint = %self.handler.stream.endpoint(),
                "Push channel unavailable, relying on polling"
            );
        }
        connected
    }

    /// Start a manual backup for `client_id`.
    pub async fn start_backup(&self, client_id: &str) -> Result<StartedBackup, StartError> {
        let started = self.handler.initiator.start(client_id).await?;
        if let Some(job_id) = started.job_id {
            self.handler.notifier.on_started(job_id, client_id).await;
        }
        Ok(started)
    }

    pub async fn dismiss(&self, job_id: JobId) -> bool {
        self.handler.notifier.dismiss(job_id).await
    }

    /// Apply one stream event, as the consumer task does.
    pub async fn handle_event(&self, event: StreamEvent) {
        self.handler.handle(event).await;
    }

    /// One pull-and-reconcile cycle, as the poll loop does.
    pub async fn poll_once(&self) {
        self.handler.poll().await;
    }

    /// Stop both loops, close the push channel and cancel pending refreshes.
    /// Safe to call more than once.
    pub fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        self.handler.stream.disconnect();
        self.handler.registry.shutdown();

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        info!("Monitor shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn consume(
    handler: Handler,
    mut rx: mpsc::UnboundedReceiver<StreamEvent>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => match event {
                Some(event) => handler.handle(event).await,
                None => break,
            },
        }
    }
    debug!("Event consumer stopped");
}

async fn poll(handler: Handler, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => handler.poll().await,
        }
    }
    debug!("Poll loop stopped");
}

impl Handler {
    async fn handle(&self, event: StreamEvent) {
        match event {
            StreamEvent::BackupStarted(started) => {
                self.registry.apply_started(&started).await;
                self.notifier
                    .on_started(started.job_id, &started.client_id)
                    .await;
                self.initiator.on_started(&started.client_id, started.job_id);
                info!(job_id = %started.job_id, client_id = %started.client_id, "Backup started");
            }
            StreamEvent::BackupProgress(progress) => {
                let outcome = self.registry.apply_progress(&progress).await;
                let visible = self
                    .notifier
                    .on_progress(progress.job_id, &progress.client_id, progress.progress)
                    .await;
                if self.progress_log.should_log(&progress.job_id) {
                    info!(
                        job_id = %progress.job_id,
                        client_id = %progress.client_id,
                        progress = progress.progress,
                        ?outcome,
                        visible,
                        "Backup progress"
                    );
                }
            }
            StreamEvent::BackupCompleted(finished) => {
                info!(job_id = %finished.job_id, client_id = %finished.client_id, "Backup completed");
                self.finish(JobStatus::Completed, &finished).await;
            }
            StreamEvent::BackupFailed(finished) => {
                warn!(
                    job_id = %finished.job_id,
                    client_id = %finished.client_id,
                    error = finished.error.as_deref().unwrap_or("unknown"),
                    "Backup failed"
                );
                self.finish(JobStatus::Failed, &finished).await;
            }
            StreamEvent::JobStatusData(jobs) => {
                let terminal: Vec<JobId> = jobs
                    .iter()
                    .filter(|job| job.status.is_terminal())
                    .filter_map(|job| job.id)
                    .collect();
                let summary = self.registry.apply_snapshot(jobs).await;
                for job_id in terminal {
                    self.notifier.on_terminal(job_id).await;
                }
                self.initiator.reconcile().await;
                debug!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    "Job status received"
                );
            }
            StreamEvent::Connection { connected: true } => {
                info!("Push channel connected");
                self.stream.get_job_status(None);
            }
            StreamEvent::Connection { connected: false } => {
                warn!("Push channel disconnected");
            }
            StreamEvent::ConnectionEstablished(data) => {
                debug!(%data, "Session registered");
            }
            StreamEvent::ConfigurationSaved(data) => {
                info!(%data, "Configuration saved");
            }
            StreamEvent::ConfigurationData(config) => match config {
                Some(config) => info!(client_id = %config.client_id, host = %config.host, "Configuration received"),
                None => info!("No configuration stored"),
            },
            StreamEvent::SshTestResult(result) => {
                let client_id = result.client_id.as_deref().unwrap_or("-");
                let message = result.message.as_deref().unwrap_or("");
                if result.success {
                    info!(%client_id, %message, "SSH connection test succeeded");
                } else {
                    warn!(%client_id, %message, "SSH connection test failed");
                }
            }
            StreamEvent::Error { error } => {
                warn!(%error, "Backend reported an error");
            }
            StreamEvent::MaxReconnectAttemptsReached { attempts } => {
                error!(attempts, "Push channel gave up reconnecting, relying on polling");
            }
        }
    }

    async fn finish(&self, status: JobStatus, finished: &BackupFinished) {
        self.registry.apply_terminal(status, finished).await;
        self.notifier.on_terminal(finished.job_id).await;
        self.initiator
            .on_terminal(&finished.client_id, finished.job_id);
        self.progress_log.reset(&finished.job_id);
    }

    async fn poll(&self) {
        match self.registry.sync().await {
            Ok(summary) => {
                debug!(
                    inserted = summary.active.inserted,
                    updated = summary.active.updated,
                    refreshed = summary.clients_refreshed.len(),
                    "Polled active jobs"
                );
                for job_id in summary.finished {
                    info!(%job_id, "Job finished without a push event");
                    self.notifier.on_terminal(job_id).await;
                    self.progress_log.reset(&job_id);
                }
            }
            Err(e) => warn!(error = %e, "Polling active jobs failed"),
        }
        let released = self.initiator.reconcile().await;
        if released > 0 {
            debug!(released, "Released finished in-flight guards");
        }
    }
}
