//! REST collaborator used by the monitor.
//!
//! The backend owns job execution and configuration storage. The monitor only
//! starts jobs, pulls snapshots and triggers SSH checks through this seam, and
//! treats every call as slow and fallible.

mod http;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::models::{BackupJob, SshTestResult, StartResponse};
use crate::error::ApiResult;

pub use http::HttpBackupApi;

#[async_trait]
pub trait BackupApi: Send + Sync {
    /// `POST /start/{clientId}`
    async fn start_backup(&self, client_id: &str) -> ApiResult<StartResponse>;

    /// `GET /jobs/active`
    async fn active_jobs(&self) -> ApiResult<Vec<BackupJob>>;

    /// `GET /jobs/{clientId}?limit=N`
    async fn client_jobs(&self, client_id: &str, limit: usize) -> ApiResult<Vec<BackupJob>>;

    /// `POST /test-ssh/{clientId}`
    async fn test_ssh(&self, client_id: &str) -> ApiResult<SshTestResult>;
}

/// Build the HTTP-backed API client from config.
pub fn create_api(config: &AppConfig) -> ApiResult<Arc<dyn BackupApi>> {
    Ok(Arc::new(HttpBackupApi::from_config(config)?))
}
