//! Per-job progress visibility.
//!
//! Each job occurrence gets one subscription that walks
//! `Hidden -> Visible -> Dismissed -> Hidden`. Dismissing only hides the
//! progress display; the job itself keeps running and keeps being tracked by
//! the registry. A new job for the same client starts a fresh, visible
//! subscription.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use super::models::JobId;

/// Finished subscriptions kept so late events for them stay hidden.
const RETAINED_FINISHED: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Hidden,
    Visible,
    Dismissed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSubscription {
    pub job_id: JobId,
    pub client_id: String,
    pub visibility: Visibility,
    pub last_seen_progress: u8,
}

impl ProgressSubscription {
    fn new(job_id: JobId, client_id: &str) -> Self {
        Self {
            job_id,
            client_id: client_id.to_string(),
            visibility: Visibility::Visible,
            last_seen_progress: 0,
        }
    }

    pub fn dismissed(&self) -> bool {
        self.visibility == Visibility::Dismissed
    }
}

#[derive(Default)]
struct NotifierState {
    subscriptions: HashMap<JobId, ProgressSubscription>,
    /// Latest job occurrence per client.
    active: HashMap<String, JobId>,
    /// Hidden subscriptions, oldest first.
    finished: VecDeque<JobId>,
    retain_finished: usize,
}

impl NotifierState {
    fn open(&mut self, job_id: JobId, client_id: &str) -> &mut ProgressSubscription {
        if !self.subscriptions.contains_key(&job_id) {
            self.active.insert(client_id.to_string(), job_id);
        }
        self.subscriptions
            .entry(job_id)
            .or_insert_with(|| ProgressSubscription::new(job_id, client_id))
    }

    fn retire(&mut self, job_id: JobId) {
        self.finished.push_back(job_id);
        while self.finished.len() > self.retain_finished {
            if let Some(oldest) = self.finished.pop_front() {
                self.subscriptions.remove(&oldest);
            }
        }
    }
}

/// Thread-safe store of progress subscriptions, shared through the monitor.
///
/// Only the most recent finished subscriptions are kept; older ones are
/// dropped as new jobs finish.
#[derive(Clone)]
pub struct ProgressNotifier {
    inner: Arc<RwLock<NotifierState>>,
}

impl Default for ProgressNotifier {
    fn default() -> Self {
        Self::with_retention(RETAINED_FINISHED)
    }
}

impl ProgressNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `retain_finished` finished subscriptions.
    pub fn with_retention(retain_finished: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(NotifierState {
                retain_finished,
                ..NotifierState::default()
            })),
        }
    }

    /// A job started. Repeated starts for the same job keep its current visibility.
    pub async fn on_started(&self, job_id: JobId, client_id: &str) -> Visibility {
        let mut state = self.inner.write().await;
        state.open(job_id, client_id).visibility
    }

    /// Record progress and report whether it should be displayed.
    pub async fn on_progress(&self, job_id: JobId, client_id: &str, progress: u8) -> bool {
        let mut state = self.inner.write().await;
        let sub = state.open(job_id, client_id);
        sub.last_seen_progress = sub.last_seen_progress.max(progress);
        sub.visibility == Visibility::Visible
    }

    /// Hide a visible progress display. The job is unaffected.
    pub async fn dismiss(&self, job_id: JobId) -> bool {
        let mut state = self.inner.write().await;
        match state.subscriptions.get_mut(&job_id) {
            Some(sub) if sub.visibility == Visibility::Visible => {
                sub.visibility = Visibility::Dismissed;
                debug!(%job_id, client_id = %sub.client_id, "Progress dismissed");
                true
            }
            _ => false,
        }
    }

    pub async fn on_terminal(&self, job_id: JobId) {
        let mut state = self.inner.write().await;
        let Some(sub) = state.subscriptions.get_mut(&job_id) else {
            return;
        };
        if sub.visibility == Visibility::Hidden {
            return;
        }
        sub.visibility = Visibility::Hidden;
        let client_id = sub.client_id.clone();
        if state.active.get(&client_id) == Some(&job_id) {
            state.active.remove(&client_id);
        }
        state.retire(job_id);
    }

    /// Number of subscriptions held, finished ones included.
    pub async fn len(&self) -> usize {
        self.inner.read().await.subscriptions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_visible(&self, job_id: JobId) -> bool {
        let state = self.inner.read().await;
        state
            .subscriptions
            .get(&job_id)
            .is_some_and(|sub| sub.visibility == Visibility::Visible)
    }

    pub async fn subscription(&self, job_id: JobId) -> Option<ProgressSubscription> {
        let state = self.inner.read().await;
        state.subscriptions.get(&job_id).cloned()
    }

    /// Visible subscriptions ordered by job id.
    pub async fn visible(&self) -> Vec<ProgressSubscription> {
        let state = self.inner.read().await;
        let mut subs: Vec<_> = state
            .subscriptions
            .values()
            .filter(|sub| sub.visibility == Visibility::Visible)
            .cloned()
            .collect();
        subs.sort_by_key(|sub| sub.job_id);
        subs
    }

    /// The client's current, non-terminal job occurrence.
    pub async fn active_for_client(&self, client_id: &str) -> Option<ProgressSubscription> {
        let state = self.inner.read().await;
        let job_id = state.active.get(client_id)?;
        state.subscriptions.get(job_id).cloned()
    }
}
