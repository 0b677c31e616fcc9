use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Remote-assigned backup job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position along `PENDING -> RUNNING -> terminal`. Status never moves to a lower rank.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[default]
    Manual,
    Scheduled,
}

/// One execution of a backup for one client.
///
/// `id` is `None` only for optimistic placeholders created before the
/// backend has reported the real job id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJob {
    #[serde(default)]
    pub id: Option<JobId>,
    pub client_id: String,
    #[serde(default)]
    pub configuration_id: Option<i64>,
    pub status: JobStatus,
    #[serde(default)]
    pub job_type: JobType,
    #[serde(default, with = "timestamp")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "timestamp")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub files_processed: Option<u64>,
    #[serde(default)]
    pub files_total: Option<u64>,
    #[serde(default)]
    pub bytes_transferred: Option<u64>,
    #[serde(default, deserialize_with = "percentage::deserialize")]
    pub progress_percentage: Option<u8>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub log_details: Option<String>,
}

impl BackupJob {
    /// A job with only identity and status set.
    pub fn new(id: Option<JobId>, client_id: impl Into<String>, status: JobStatus) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            configuration_id: None,
            status,
            job_type: JobType::Manual,
            started_at: None,
            finished_at: None,
            files_processed: None,
            files_total: None,
            bytes_transferred: None,
            progress_percentage: None,
            error_message: None,
            log_details: None,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.id.is_none()
    }
}

/// `BACKUP_STARTED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupStarted {
    pub job_id: JobId,
    pub client_id: String,
    #[serde(default)]
    pub message: Option<String>,
}

/// `BACKUP_PROGRESS` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    pub client_id: String,
    #[serde(deserialize_with = "percentage::deserialize_required")]
    pub progress: u8,
    #[serde(default)]
    pub message: Option<String>,
}

/// `BACKUP_COMPLETED` / `BACKUP_FAILED` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupFinished {
    pub job_id: JobId,
    pub client_id: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, with = "timestamp")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// `SSH_TEST_RESULT` payload and `POST /test-ssh/{clientId}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshTestResult {
    #[serde(default)]
    pub client_id: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// `POST /start/{clientId}` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    #[serde(default)]
    pub job_id: Option<JobId>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

/// Persisted backup configuration for one client.
///
/// Only its read/write contract matters here; storage lives in the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfiguration {
    #[serde(default)]
    pub id: Option<i64>,
    pub client_id: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub remote_path: String,
    #[serde(default)]
    pub local_path: Option<String>,
    /// Cron expression for scheduled runs.
    #[serde(default)]
    pub schedule: Option<String>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Progress values outside 0..=100 are clamped rather than rejected.
mod percentage {
    use serde::{Deserialize, Deserializer};

    fn clamp(value: f64) -> u8 {
        value.clamp(0.0, 100.0).round() as u8
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<f64>::deserialize(deserializer)?.map(clamp))
    }

    pub fn deserialize_required<'de, D>(deserializer: D) -> Result<u8, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(clamp(f64::deserialize(deserializer)?))
    }
}

/// Backend timestamps come either as RFC 3339 or as zone-less ISO local
/// date-times; the latter are read as UTC.
mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&ts.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        parse(&raw).map(Some).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(raw: &str) -> Result<DateTime<Utc>, String> {
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Ok(ts.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| naive.and_utc())
            .map_err(|e| format!("invalid timestamp {raw:?}: {e}"))
    }
}
