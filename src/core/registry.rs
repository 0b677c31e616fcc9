//! In-memory job table reconciling push events with pull snapshots.
//!
//! Two sources feed the table: progress events from the push channel and
//! REST snapshots. Neither is trusted to be ordered or complete, so every
//! write goes through one of the merge functions below:
//!
//! - status only moves forward along `PENDING -> RUNNING -> terminal`
//! - a RUNNING job's progress never decreases
//! - a terminal event overrides everything, and nothing leaves a terminal status
//! - snapshots are not exhaustive: a job missing from one is left alone
//!
//! Each merge computes the new record and writes it under a single write
//! lock, so readers never see a half-applied update.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::models::{
    BackupFinished, BackupJob, BackupStarted, JobId, JobStatus, ProgressEvent,
};
use crate::api::BackupApi;
use crate::error::ApiResult;

/// Files-total placeholder for jobs first seen through the push channel,
/// which only reports a percentage.
pub const PROVISIONAL_FILES_TOTAL: u64 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied,
    Discarded,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotSummary {
    pub inserted: usize,
    pub updated: usize,
    pub ignored: usize,
}

/// Result of [`JobRegistry::sync`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub active: SnapshotSummary,
    /// Clients whose history was pulled because a running job left the active list.
    pub clients_refreshed: Vec<String>,
    /// Jobs that history showed as terminal.
    pub finished: Vec<JobId>,
}

struct Entry {
    job: BackupJob,
    /// `files_total` is still the push-derived placeholder.
    provisional_scale: bool,
}

#[derive(Default)]
struct JobTable {
    jobs: HashMap<JobId, Entry>,
    /// Placeholders for started jobs whose id is not known yet, by client id.
    optimistic: HashMap<String, BackupJob>,
}

struct RegistryInner {
    api: Arc<dyn BackupApi>,
    refresh_window: Duration,
    history_limit: usize,
    table: RwLock<JobTable>,
    refresh_timer: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Authoritative table of known backup jobs.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    pub fn new(api: Arc<dyn BackupApi>, refresh_window: Duration, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                api,
                refresh_window,
                history_limit,
                table: RwLock::new(JobTable::default()),
                refresh_timer: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    // ── Merge operations ────────────────────────────────────────────

    /// A job reported as started, by the push channel or the start endpoint.
    pub async fn apply_started(&self, event: &BackupStarted) -> MergeOutcome {
        let mut table = self.inner.table.write().await;
        table.optimistic.remove(&event.client_id);

        match table.jobs.get_mut(&event.job_id) {
            None => {
                let mut job = BackupJob::new(
                    Some(event.job_id),
                    event.client_id.clone(),
                    JobStatus::Running,
                );
                job.started_at = Some(Utc::now());
                job.progress_percentage = Some(0);
                job.files_processed = Some(0);
                job.files_total = Some(PROVISIONAL_FILES_TOTAL);
                table.jobs.insert(
                    event.job_id,
                    Entry {
                        job,
                        provisional_scale: true,
                    },
                );
                MergeOutcome::Applied
            }
            Some(entry) if entry.job.status == JobStatus::Pending => {
                entry.job.status = JobStatus::Running;
                entry.job.started_at.get_or_insert_with(Utc::now);
                MergeOutcome::Applied
            }
            Some(_) => MergeOutcome::Discarded,
        }
    }

    /// Seed the entry for a job id returned by the start endpoint.
    pub async fn confirm_started(&self, job_id: JobId, client_id: &str) -> MergeOutcome {
        self.apply_started(&BackupStarted {
            job_id,
            client_id: client_id.to_string(),
            message: None,
        })
        .await
    }

    /// Apply a push progress event. Lower-than-seen values and events for
    /// terminal jobs are discarded. Applied updates schedule a coalesced refresh.
    pub async fn apply_progress(&self, event: &ProgressEvent) -> MergeOutcome {
        let outcome = {
            let mut table = self.inner.table.write().await;
            table.optimistic.remove(&event.client_id);

            match table.jobs.get_mut(&event.job_id) {
                None => {
                    let mut job = BackupJob::new(
                        Some(event.job_id),
                        event.client_id.clone(),
                        JobStatus::Running,
                    );
                    job.started_at = Some(Utc::now());
                    job.files_total = Some(PROVISIONAL_FILES_TOTAL);
                    job.files_processed = Some(u64::from(event.progress));
                    job.progress_percentage = Some(event.progress);
                    job.log_details = event.message.clone();
                    table.jobs.insert(
                        event.job_id,
                        Entry {
                            job,
                            provisional_scale: true,
                        },
                    );
                    MergeOutcome::Applied
                }
                Some(entry) if entry.job.status.is_terminal() => MergeOutcome::Discarded,
                Some(entry) if event.progress < entry.job.progress_percentage.unwrap_or(0) => {
                    MergeOutcome::Discarded
                }
                Some(entry) => {
                    entry.job.status = JobStatus::Running;
                    entry.job.progress_percentage = Some(event.progress);
                    if entry.provisional_scale {
                        entry.job.files_processed = Some(u64::from(event.progress));
                    }
                    if event.message.is_some() {
                        entry.job.log_details = event.message.clone();
                    }
                    MergeOutcome::Applied
                }
            }
        };

        match outcome {
            MergeOutcome::Applied => self.schedule_refresh(),
            MergeOutcome::Discarded => debug!(
                job_id = %event.job_id,
                progress = event.progress,
                "Discarded stale progress"
            ),
        }
        outcome
    }

    /// Merge a pull snapshot. Jobs not in the snapshot are left untouched.
    pub async fn apply_snapshot(&self, jobs: Vec<BackupJob>) -> SnapshotSummary {
        let mut summary = SnapshotSummary::default();
        let mut table = self.inner.table.write().await;

        for incoming in jobs {
            let Some(id) = incoming.id else {
                warn!(client_id = %incoming.client_id, "Snapshot job without id ignored");
                summary.ignored += 1;
                continue;
            };

            if !incoming.status.is_terminal() {
                table.optimistic.remove(&incoming.client_id);
            }

            match table.jobs.get_mut(&id) {
                Some(entry) => {
                    merge_snapshot(entry, incoming);
                    summary.updated += 1;
                }
                None => {
                    table.jobs.insert(
                        id,
                        Entry {
                            job: incoming,
                            provisional_scale: false,
                        },
                    );
                    summary.inserted += 1;
                }
            }
        }

        summary
    }

    /// Force a terminal status, regardless of progress. Triggers an immediate
    /// refresh of the client's recent jobs.
    pub async fn apply_terminal(&self, status: JobStatus, event: &BackupFinished) -> MergeOutcome {
        if !status.is_terminal() {
            warn!(job_id = %event.job_id, %status, "apply_terminal called with non-terminal status");
            return MergeOutcome::Discarded;
        }

        let outcome = {
            let mut table = self.inner.table.write().await;
            table.optimistic.remove(&event.client_id);
            let finished_at = event.finished_at.unwrap_or_else(Utc::now);

            match table.jobs.get_mut(&event.job_id) {
                Some(entry) if entry.job.status.is_terminal() => MergeOutcome::Discarded,
                Some(entry) => {
                    entry.job.status = status;
                    entry.job.finished_at = Some(finished_at);
                    if event.error.is_some() {
                        entry.job.error_message = event.error.clone();
                    }
                    MergeOutcome::Applied
                }
                None => {
                    let mut job =
                        BackupJob::new(Some(event.job_id), event.client_id.clone(), status);
                    job.finished_at = Some(finished_at);
                    job.error_message = event.error.clone();
                    table.jobs.insert(
                        event.job_id,
                        Entry {
                            job,
                            provisional_scale: false,
                        },
                    );
                    MergeOutcome::Applied
                }
            }
        };

        if outcome == MergeOutcome::Applied {
            let registry = self.clone();
            let client_id = event.client_id.clone();
            tokio::spawn(async move {
                if let Err(e) = registry.refresh_client(&client_id).await {
                    warn!(%client_id, error = %e, "Post-completion refresh failed");
                }
            });
        }
        outcome
    }

    /// Insert (or replace) the placeholder for a start whose job id is not known yet.
    pub async fn insert_optimistic(
        &self,
        client_id: &str,
        configuration_id: Option<i64>,
    ) -> BackupJob {
        let mut job = BackupJob::new(None, client_id, JobStatus::Pending);
        job.configuration_id = configuration_id;
        job.started_at = Some(Utc::now());

        let mut table = self.inner.table.write().await;
        table.optimistic.insert(client_id.to_string(), job.clone());
        job
    }

    // ── Pull snapshots ──────────────────────────────────────────────

    /// Pull `GET /jobs/active` and merge it. On failure the table keeps its last state.
    pub async fn refresh(&self) -> ApiResult<SnapshotSummary> {
        let jobs = self.inner.api.active_jobs().await?;
        Ok(self.apply_fetched(jobs).await)
    }

    /// Pull the client's most recent jobs and merge them.
    pub async fn refresh_client(&self, client_id: &str) -> ApiResult<SnapshotSummary> {
        let jobs = self
            .inner
            .api
            .client_jobs(client_id, self.inner.history_limit)
            .await?;
        Ok(self.apply_fetched(jobs).await)
    }

    /// Pull the active list, then the recent history of every client with a
    /// non-terminal job that the active list no longer reports. Catches up on
    /// terminal events the push channel missed.
    pub async fn sync(&self) -> ApiResult<SyncSummary> {
        let jobs = self.inner.api.active_jobs().await?;
        let listed: HashSet<JobId> = jobs.iter().filter_map(|job| job.id).collect();
        let active = self.apply_fetched(jobs).await;

        let unlisted: Vec<(JobId, String)> = {
            let table = self.inner.table.read().await;
            table
                .jobs
                .iter()
                .filter(|(id, entry)| !entry.job.status.is_terminal() && !listed.contains(id))
                .map(|(id, entry)| (*id, entry.job.client_id.clone()))
                .collect()
        };

        let mut summary = SyncSummary {
            active,
            ..SyncSummary::default()
        };
        let clients: HashSet<&str> = unlisted.iter().map(|(_, client)| client.as_str()).collect();
        for client_id in clients {
            match self.refresh_client(client_id).await {
                Ok(_) => summary.clients_refreshed.push(client_id.to_string()),
                Err(e) => warn!(%client_id, error = %e, "History refresh failed"),
            }
        }
        summary.clients_refreshed.sort();

        let table = self.inner.table.read().await;
        summary.finished = unlisted
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| {
                table
                    .jobs
                    .get(id)
                    .is_some_and(|entry| entry.job.status.is_terminal())
            })
            .collect();
        summary.finished.sort();
        Ok(summary)
    }

    async fn apply_fetched(&self, jobs: Vec<BackupJob>) -> SnapshotSummary {
        if self.is_closed() {
            debug!(count = jobs.len(), "Registry closed, snapshot discarded");
            return SnapshotSummary::default();
        }
        let summary = self.apply_snapshot(jobs).await;
        debug!(
            inserted = summary.inserted,
            updated = summary.updated,
            "Snapshot merged"
        );
        summary
    }

    /// Start the coalescing timer unless one is already pending.
    fn schedule_refresh(&self) {
        let mut timer = self
            .inner
            .refresh_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if timer.is_some() || self.is_closed() {
            return;
        }

        let registry = self.clone();
        let window = self.inner.refresh_window;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Events from here on start a new window.
            registry
                .inner
                .refresh_timer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take();
            if let Err(e) = registry.refresh().await {
                warn!(error = %e, "Coalesced refresh failed");
            }
        }));
    }

    pub fn refresh_pending(&self) -> bool {
        self.inner
            .refresh_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// All jobs, newest first, including optimistic placeholders. Returns owned copies.
    pub async fn list(&self) -> Vec<BackupJob> {
        let table = self.inner.table.read().await;
        let mut jobs: Vec<BackupJob> = table
            .jobs
            .values()
            .map(|entry| entry.job.clone())
            .chain(table.optimistic.values().cloned())
            .collect();
        jobs.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        jobs
    }

    pub async fn get(&self, job_id: JobId) -> Option<BackupJob> {
        let table = self.inner.table.read().await;
        table.jobs.get(&job_id).map(|entry| entry.job.clone())
    }

    pub async fn optimistic(&self, client_id: &str) -> Option<BackupJob> {
        let table = self.inner.table.read().await;
        table.optimistic.get(client_id).cloned()
    }

    /// Most recent job for a client, by start time.
    pub async fn latest_for_client(&self, client_id: &str) -> Option<BackupJob> {
        self.list()
            .await
            .into_iter()
            .find(|job| job.client_id == client_id)
    }

    /// Non-terminal jobs, placeholders included.
    pub async fn active_count(&self) -> usize {
        let table = self.inner.table.read().await;
        table
            .jobs
            .values()
            .filter(|entry| !entry.job.status.is_terminal())
            .count()
            + table.optimistic.len()
    }

    // ── Teardown ────────────────────────────────────────────────────

    /// Cancel the pending refresh timer. REST results that arrive afterwards are dropped.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let timer = self
            .inner
            .refresh_timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(timer) = timer {
            timer.abort();
        }
        info!("Job registry shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Snapshot values win except where they would move a job backwards.
fn merge_snapshot(entry: &mut Entry, incoming: BackupJob) {
    let current = &entry.job;

    let status = if current.status.is_terminal() || incoming.status.rank() < current.status.rank()
    {
        current.status
    } else {
        incoming.status
    };

    let progress_percentage = if status == JobStatus::Running {
        current.progress_percentage.max(incoming.progress_percentage)
    } else {
        incoming.progress_percentage.or(current.progress_percentage)
    };

    let provisional_scale = entry.provisional_scale && incoming.files_total.is_none();

    let merged = BackupJob {
        id: current.id,
        client_id: incoming.client_id,
        configuration_id: incoming.configuration_id.or(current.configuration_id),
        status,
        job_type: incoming.job_type,
        started_at: incoming.started_at.or(current.started_at),
        finished_at: incoming.finished_at.or(current.finished_at),
        files_processed: incoming.files_processed.or(current.files_processed),
        files_total: incoming.files_total.or(current.files_total),
        bytes_transferred: incoming.bytes_transferred.or(current.bytes_transferred),
        progress_percentage,
        error_message: incoming.error_message.or_else(|| current.error_message.clone()),
        log_details: incoming.log_details.or_else(|| current.log_details.clone()),
    };

    entry.job = merged;
    entry.provisional_scale = provisional_scale;
}
