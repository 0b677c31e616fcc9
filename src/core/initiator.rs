//! Manual backup starts with a per-client in-flight guard.
//!
//! A client stays in flight from the moment `start` is accepted until a
//! terminal event for it arrives, so a second start for the same client is
//! rejected locally without reaching the backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, info, warn};

use super::models::JobId;
use super::registry::JobRegistry;
use crate::api::BackupApi;
use crate::error::StartError;

/// Result of an accepted start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedBackup {
    pub client_id: String,
    /// `None` when the backend did not report the job id; an optimistic
    /// placeholder stands in for the job until it does.
    pub job_id: Option<JobId>,
    pub message: Option<String>,
}

pub struct BackupInitiator {
    api: Arc<dyn BackupApi>,
    registry: JobRegistry,
    /// Client id -> bound job id, once known.
    in_flight: Mutex<HashMap<String, Option<JobId>>>,
}

impl BackupInitiator {
    pub fn new(api: Arc<dyn BackupApi>, registry: JobRegistry) -> Self {
        Self {
            api,
            registry,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, Option<JobId>>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn start(&self, client_id: &str) -> Result<StartedBackup, StartError> {
        {
            let mut in_flight = self.guard();
            if in_flight.contains_key(client_id) {
                debug!(%client_id, "Backup already in progress, start rejected");
                return Err(StartError::AlreadyInProgress {
                    client_id: client_id.to_string(),
                });
            }
            in_flight.insert(client_id.to_string(), None);
        }

        let response = match self.api.start_backup(client_id).await {
            Ok(response) => response,
            Err(e) => {
                self.guard().remove(client_id);
                warn!(%client_id, error = %e, "Backup start request failed");
                return Err(StartError::Request(e));
            }
        };

        match response.job_id {
            Some(job_id) => {
                self.registry.confirm_started(job_id, client_id).await;
                self.on_started(client_id, job_id);
                info!(%client_id, %job_id, "Backup started");
            }
            None => {
                // A push event may already have named (or finished) the job.
                let unbound = matches!(self.guard().get(client_id), Some(None));
                if unbound {
                    self.registry.insert_optimistic(client_id, None).await;
                    info!(%client_id, "Backup started, waiting for job id");
                } else {
                    debug!(%client_id, "Job already reported, placeholder skipped");
                }
            }
        }

        // A terminal event may have raced ahead of the start response.
        self.reconcile().await;

        Ok(StartedBackup {
            client_id: client_id.to_string(),
            job_id: response.job_id,
            message: response.message,
        })
    }

    /// Bind the real job id to a client's in-flight entry.
    pub fn on_started(&self, client_id: &str, job_id: JobId) {
        if let Some(bound) = self.guard().get_mut(client_id) {
            *bound = Some(job_id);
        }
    }

    /// Release the client's guard. A terminal event for a job other than the
    /// bound one is ignored.
    pub fn on_terminal(&self, client_id: &str, job_id: JobId) -> bool {
        let mut in_flight = self.guard();
        match in_flight.get(client_id) {
            Some(Some(bound)) if *bound != job_id => {
                debug!(%client_id, %job_id, bound = %bound, "Terminal event for other job, guard kept");
                false
            }
            Some(_) => {
                in_flight.remove(client_id);
                debug!(%client_id, %job_id, "In-flight guard released");
                true
            }
            None => false,
        }
    }

    /// Release guards whose bound job the registry already holds as terminal.
    pub async fn reconcile(&self) -> usize {
        let bound: Vec<(String, JobId)> = self
            .guard()
            .iter()
            .filter_map(|(client, job)| job.map(|id| (client.clone(), id)))
            .collect();

        let mut released = 0;
        for (client_id, job_id) in bound {
            let terminal = self
                .registry
                .get(job_id)
                .await
                .is_some_and(|job| job.status.is_terminal());
            if terminal && self.on_terminal(&client_id, job_id) {
                released += 1;
            }
        }
        released
    }

    pub fn is_in_flight(&self, client_id: &str) -> bool {
        self.guard().contains_key(client_id)
    }

    pub fn in_flight(&self) -> Vec<String> {
        let mut clients: Vec<String> = self.guard().keys().cloned().collect();
        clients.sort();
        clients
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobStatus;
    use crate::core::test_support::{FakeApi, finished, job, started};
    use crate::error::ApiError;
    use std::time::Duration;

    fn setup() -> (Arc<BackupInitiator>, JobRegistry, Arc<FakeApi>) {
        let api = Arc::new(FakeApi::default());
        let registry = JobRegistry::new(api.clone(), Duration::from_millis(2000), 10);
        let initiator = Arc::new(BackupInitiator::new(api.clone(), registry.clone()));
        (initiator, registry, api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_issues_one_request() {
        let (initiator, registry, api) = setup();
        *api.start_delay.lock().unwrap() = Duration::from_millis(500);

        let first = {
            let initiator = initiator.clone();
            tokio::spawn(async move { initiator.start("c1").await })
        };
        tokio::task::yield_now().await;

        let second = initiator.start("c1").await;
        assert!(matches!(
            second,
            Err(StartError::AlreadyInProgress { ref client_id }) if client_id == "c1"
        ));

        let started = first.await.unwrap().unwrap();
        assert_eq!(started.job_id, Some(JobId(100)));
        assert_eq!(api.start_calls(), 1);
        assert_eq!(
            registry.get(JobId(100)).await.unwrap().status,
            JobStatus::Running
        );
        assert!(initiator.is_in_flight("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_start_releases_guard() {
        let (initiator, registry, api) = setup();
        api.push_start_result(Err(ApiError::Http {
            status: 500,
            body: "boom".into(),
        }));

        let err = initiator.start("c1").await.unwrap_err();
        assert!(matches!(err, StartError::Request(ApiError::Http { status: 500, .. })));
        assert!(!initiator.is_in_flight("c1"));
        assert!(registry.list().await.is_empty());

        initiator.start("c1").await.unwrap();
        assert_eq!(api.start_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_job_id_creates_placeholder() {
        let (initiator, registry, api) = setup();
        api.push_start_result(Ok(crate::core::models::StartResponse {
            job_id: None,
            message: Some("queued".into()),
        }));

        let started = initiator.start("c2").await.unwrap();
        assert_eq!(started.job_id, None);
        assert_eq!(started.message.as_deref(), Some("queued"));

        let placeholder = registry.optimistic("c2").await.unwrap();
        assert_eq!(placeholder.status, JobStatus::Pending);
        assert!(initiator.is_in_flight("c2"));

        // The first push event names the job and binds it.
        initiator.on_started("c2", JobId(55));
        assert!(!initiator.on_terminal("c2", JobId(54)));
        assert!(initiator.on_terminal("c2", JobId(55)));
        assert!(initiator.in_flight().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_event_releases_guard() {
        let (initiator, registry, _api) = setup();
        let started = initiator.start("c1").await.unwrap();
        let job_id = started.job_id.unwrap();
        assert_eq!(initiator.in_flight(), vec!["c1".to_string()]);

        registry
            .apply_terminal(JobStatus::Completed, &finished(job_id.0, "c1", None))
            .await;
        assert!(initiator.on_terminal("c1", job_id));
        assert!(!initiator.is_in_flight("c1"));

        initiator.start("c1").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconcile_releases_terminal_jobs() {
        let (initiator, registry, _api) = setup();
        initiator.start("c1").await.unwrap();
        initiator.start("c2").await.unwrap();

        // Job 100 finished; only a snapshot told us.
        registry
            .apply_snapshot(vec![job(100, "c1", JobStatus::Failed)])
            .await;

        assert_eq!(initiator.reconcile().await, 1);
        assert_eq!(initiator.in_flight(), vec!["c2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_before_start_response() {
        let (initiator, registry, api) = setup();
        *api.start_delay.lock().unwrap() = Duration::from_millis(200);

        let pending = {
            let initiator = initiator.clone();
            tokio::spawn(async move { initiator.start("c1").await })
        };
        tokio::task::yield_now().await;

        // The push channel reports completion before REST answers.
        registry
            .apply_terminal(JobStatus::Completed, &finished(100, "c1", None))
            .await;

        pending.await.unwrap().unwrap();
        assert!(!initiator.is_in_flight("c1"));
        assert_eq!(
            registry.get(JobId(100)).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_placeholder_after_job_finished_during_start() {
        let (initiator, registry, api) = setup();
        *api.start_delay.lock().unwrap() = Duration::from_millis(200);
        api.push_start_result(Ok(crate::core::models::StartResponse {
            job_id: None,
            message: None,
        }));

        let pending = {
            let initiator = initiator.clone();
            tokio::spawn(async move { initiator.start("c1").await })
        };
        tokio::task::yield_now().await;

        registry.apply_started(&started(55, "c1")).await;
        initiator.on_started("c1", JobId(55));
        registry
            .apply_terminal(JobStatus::Completed, &finished(55, "c1", None))
            .await;
        assert!(initiator.on_terminal("c1", JobId(55)));

        let started = pending.await.unwrap().unwrap();
        assert_eq!(started.job_id, None);
        assert!(registry.optimistic("c1").await.is_none());
        let jobs = registry.list().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, Some(JobId(55)));
        assert_eq!(registry.active_count().await, 0);
        assert!(!initiator.is_in_flight("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_placeholder_once_job_id_is_bound() {
        let (initiator, registry, api) = setup();
        *api.start_delay.lock().unwrap() = Duration::from_millis(200);
        api.push_start_result(Ok(crate::core::models::StartResponse {
            job_id: None,
            message: None,
        }));

        let pending = {
            let initiator = initiator.clone();
            tokio::spawn(async move { initiator.start("c1").await })
        };
        tokio::task::yield_now().await;

        registry.apply_started(&started(56, "c1")).await;
        initiator.on_started("c1", JobId(56));

        pending.await.unwrap().unwrap();
        assert!(registry.optimistic("c1").await.is_none());
        assert_eq!(registry.active_count().await, 1);
        assert!(initiator.is_in_flight("c1"));
    }
}
