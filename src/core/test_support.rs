//! Shared helpers for the core unit tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::api::BackupApi;
use crate::core::models::{
    BackupFinished, BackupJob, BackupStarted, JobId, JobStatus, ProgressEvent, SshTestResult,
    StartResponse,
};
use crate::error::{ApiError, ApiResult, TransportError};
use crate::stream::{Connection, Connector};

/// In-memory REST collaborator that records every call.
pub struct FakeApi {
    pub start_calls: AtomicUsize,
    pub active_calls: AtomicUsize,
    pub client_calls: Mutex<Vec<(String, usize)>>,
    /// Scripted start results; when empty, a fresh job id is returned.
    pub start_results: Mutex<VecDeque<ApiResult<StartResponse>>>,
    /// Simulated latency of the start endpoint.
    pub start_delay: Mutex<Duration>,
    pub active: Mutex<Vec<BackupJob>>,
    pub history: Mutex<Vec<BackupJob>>,
    pub fail_snapshots: AtomicBool,
    next_job_id: AtomicI64,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            start_calls: AtomicUsize::new(0),
            active_calls: AtomicUsize::new(0),
            client_calls: Mutex::new(Vec::new()),
            start_results: Mutex::new(VecDeque::new()),
            start_delay: Mutex::new(Duration::ZERO),
            active: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            fail_snapshots: AtomicBool::new(false),
            next_job_id: AtomicI64::new(100),
        }
    }
}

impl FakeApi {
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn active_calls(&self) -> usize {
        self.active_calls.load(Ordering::SeqCst)
    }

    pub fn client_calls(&self) -> Vec<(String, usize)> {
        self.client_calls.lock().unwrap().clone()
    }

    pub fn push_start_result(&self, result: ApiResult<StartResponse>) {
        self.start_results.lock().unwrap().push_back(result);
    }

    pub fn set_active(&self, jobs: Vec<BackupJob>) {
        *self.active.lock().unwrap() = jobs;
    }

    pub fn set_history(&self, jobs: Vec<BackupJob>) {
        *self.history.lock().unwrap() = jobs;
    }

    fn snapshot_error() -> ApiError {
        ApiError::Http {
            status: 503,
            body: "unavailable".into(),
        }
    }
}

#[async_trait]
impl BackupApi for FakeApi {
    async fn start_backup(&self, _client_id: &str) -> ApiResult<StartResponse> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.start_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.start_results.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| {
            Ok(StartResponse {
                job_id: Some(JobId(self.next_job_id.fetch_add(1, Ordering::SeqCst))),
                message: Some("Backup started".into()),
            })
        })
    }

    async fn active_jobs(&self) -> ApiResult<Vec<BackupJob>> {
        self.active_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(Self::snapshot_error());
        }
        Ok(self.active.lock().unwrap().clone())
    }

    async fn client_jobs(&self, client_id: &str, limit: usize) -> ApiResult<Vec<BackupJob>> {
        self.client_calls
            .lock()
            .unwrap()
            .push((client_id.to_string(), limit));
        if self.fail_snapshots.load(Ordering::SeqCst) {
            return Err(Self::snapshot_error());
        }
        Ok(self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.client_id == client_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn test_ssh(&self, client_id: &str) -> ApiResult<SshTestResult> {
        Ok(SshTestResult {
            client_id: Some(client_id.to_string()),
            success: true,
            message: None,
        })
    }
}

// ── Push channel ────────────────────────────────────────────────────

/// Server end of a connection opened by [`ChannelConnector`].
pub struct Peer {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// Connector whose every attempt succeeds, handing the server end to the test.
pub struct ChannelConnector {
    peers: mpsc::UnboundedSender<Peer>,
}

impl ChannelConnector {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Peer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { peers }), rx)
    }
}

#[async_trait]
impl Connector for ChannelConnector {
    async fn connect(&self) -> Result<Connection, TransportError> {
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.peers
            .send(Peer {
                to_client,
                from_client,
            })
            .map_err(|_| TransportError::Closed)?;
        Ok(Connection { outbound, inbound })
    }

    fn endpoint(&self) -> &str {
        "ws://fake"
    }
}

// ── Event factories ─────────────────────────────────────────────────

pub fn started(job_id: i64, client_id: &str) -> BackupStarted {
    BackupStarted {
        job_id: JobId(job_id),
        client_id: client_id.to_string(),
        message: None,
    }
}

pub fn progress(job_id: i64, client_id: &str, progress: u8) -> ProgressEvent {
    ProgressEvent {
        job_id: JobId(job_id),
        client_id: client_id.to_string(),
        progress,
        message: None,
    }
}

pub fn finished(job_id: i64, client_id: &str, error: Option<&str>) -> BackupFinished {
    BackupFinished {
        job_id: JobId(job_id),
        client_id: client_id.to_string(),
        error: error.map(String::from),
        finished_at: None,
    }
}

pub fn job(job_id: i64, client_id: &str, status: JobStatus) -> BackupJob {
    BackupJob::new(Some(JobId(job_id)), client_id, status)
}
