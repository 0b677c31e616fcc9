//! Push channel wire format.
//!
//! Every frame in either direction is a JSON envelope
//! `{"type": "...", "data": {...}, "timestamp": <unix ms>}`. Inbound types map
//! onto a fixed set of [`EventKind`]s; anything else is a [`ProtocolError`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::models::{
    BackupConfiguration, BackupFinished, BackupJob, BackupStarted, ProgressEvent, SshTestResult,
};
use crate::error::ProtocolError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

/// Inbound message types recognised on the push channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    ConnectionEstablished,
    ConfigurationSaved,
    ConfigurationData,
    BackupStarted,
    BackupProgress,
    BackupCompleted,
    BackupFailed,
    JobStatusData,
    SshTestResult,
    Error,
}

impl MessageType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CONNECTION_ESTABLISHED" => Some(Self::ConnectionEstablished),
            "CONFIGURATION_SAVED" => Some(Self::ConfigurationSaved),
            "CONFIGURATION_DATA" => Some(Self::ConfigurationData),
            "BACKUP_STARTED" => Some(Self::BackupStarted),
            "BACKUP_PROGRESS" => Some(Self::BackupProgress),
            "BACKUP_COMPLETED" => Some(Self::BackupCompleted),
            "BACKUP_FAILED" => Some(Self::BackupFailed),
            "JOB_STATUS_DATA" => Some(Self::JobStatusData),
            "SSH_TEST_RESULT" => Some(Self::SshTestResult),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionEstablished => "CONNECTION_ESTABLISHED",
            Self::ConfigurationSaved => "CONFIGURATION_SAVED",
            Self::ConfigurationData => "CONFIGURATION_DATA",
            Self::BackupStarted => "BACKUP_STARTED",
            Self::BackupProgress => "BACKUP_PROGRESS",
            Self::BackupCompleted => "BACKUP_COMPLETED",
            Self::BackupFailed => "BACKUP_FAILED",
            Self::JobStatusData => "JOB_STATUS_DATA",
            Self::SshTestResult => "SSH_TEST_RESULT",
            Self::Error => "ERROR",
        }
    }

    pub fn event_kind(&self) -> EventKind {
        match self {
            Self::ConnectionEstablished => EventKind::ConnectionEstablished,
            Self::ConfigurationSaved => EventKind::ConfigurationSaved,
            Self::ConfigurationData => EventKind::ConfigurationData,
            Self::BackupStarted => EventKind::BackupStarted,
            Self::BackupProgress => EventKind::BackupProgress,
            Self::BackupCompleted => EventKind::BackupCompleted,
            Self::BackupFailed => EventKind::BackupFailed,
            Self::JobStatusData => EventKind::JobStatusData,
            Self::SshTestResult => EventKind::SshTestResult,
            Self::Error => EventKind::Error,
        }
    }
}

/// Outbound commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    StartBackup,
    TestSshConnection,
    SaveConfiguration,
    GetConfiguration,
    GetJobStatus,
}

impl Command {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StartBackup => "START_BACKUP",
            Self::TestSshConnection => "TEST_SSH_CONNECTION",
            Self::SaveConfiguration => "SAVE_CONFIGURATION",
            Self::GetConfiguration => "GET_CONFIGURATION",
            Self::GetJobStatus => "GET_JOB_STATUS",
        }
    }
}

/// Event names listeners subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Local connection state changed.
    Connection,
    ConnectionEstablished,
    ConfigurationSaved,
    ConfigurationData,
    BackupStarted,
    BackupProgress,
    BackupCompleted,
    BackupFailed,
    JobStatusData,
    SshTestResult,
    Error,
    /// Automatic reconnection gave up.
    MaxReconnectAttemptsReached,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        Self::Connection,
        Self::ConnectionEstablished,
        Self::ConfigurationSaved,
        Self::ConfigurationData,
        Self::BackupStarted,
        Self::BackupProgress,
        Self::BackupCompleted,
        Self::BackupFailed,
        Self::JobStatusData,
        Self::SshTestResult,
        Self::Error,
        Self::MaxReconnectAttemptsReached,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::ConnectionEstablished => "connectionEstablished",
            Self::ConfigurationSaved => "configurationSaved",
            Self::ConfigurationData => "configurationData",
            Self::BackupStarted => "backupStarted",
            Self::BackupProgress => "backupProgress",
            Self::BackupCompleted => "backupCompleted",
            Self::BackupFailed => "backupFailed",
            Self::JobStatusData => "jobStatusData",
            Self::SshTestResult => "sshTestResult",
            Self::Error => "error",
            Self::MaxReconnectAttemptsReached => "maxReconnectAttemptsReached",
        }
    }
}

/// Decoded event handed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Connection { connected: bool },
    ConnectionEstablished(Value),
    ConfigurationSaved(Value),
    ConfigurationData(Option<BackupConfiguration>),
    BackupStarted(BackupStarted),
    BackupProgress(ProgressEvent),
    BackupCompleted(BackupFinished),
    BackupFailed(BackupFinished),
    JobStatusData(Vec<BackupJob>),
    SshTestResult(SshTestResult),
    Error { error: String },
    MaxReconnectAttemptsReached { attempts: u32 },
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Connection { .. } => EventKind::Connection,
            Self::ConnectionEstablished(_) => EventKind::ConnectionEstablished,
            Self::ConfigurationSaved(_) => EventKind::ConfigurationSaved,
            Self::ConfigurationData(_) => EventKind::ConfigurationData,
            Self::BackupStarted(_) => EventKind::BackupStarted,
            Self::BackupProgress(_) => EventKind::BackupProgress,
            Self::BackupCompleted(_) => EventKind::BackupCompleted,
            Self::BackupFailed(_) => EventKind::BackupFailed,
            Self::JobStatusData(_) => EventKind::JobStatusData,
            Self::SshTestResult(_) => EventKind::SshTestResult,
            Self::Error { .. } => EventKind::Error,
            Self::MaxReconnectAttemptsReached { .. } => EventKind::MaxReconnectAttemptsReached,
        }
    }
}

/// `JOB_STATUS_DATA` arrives either as a bare array or wrapped in `{"jobs": [...]}`.
#[derive(Deserialize)]
#[serde(untagged)]
enum JobStatusPayload {
    List(Vec<BackupJob>),
    Wrapped { jobs: Vec<BackupJob> },
}

fn payload<T: serde::de::DeserializeOwned>(
    kind: MessageType,
    data: Value,
) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.as_str(),
        source,
    })
}

/// Decode one inbound frame.
pub fn decode(text: &str) -> Result<(StreamEvent, Option<i64>), ProtocolError> {
    let envelope: Envelope = serde_json::from_str(text).map_err(ProtocolError::MalformedEnvelope)?;
    let kind =
        MessageType::parse(&envelope.kind).ok_or(ProtocolError::UnknownType(envelope.kind))?;
    let data = envelope.data;

    let event = match kind {
        MessageType::ConnectionEstablished => StreamEvent::ConnectionEstablished(data),
        MessageType::ConfigurationSaved => StreamEvent::ConfigurationSaved(data),
        MessageType::ConfigurationData if data.is_null() => StreamEvent::ConfigurationData(None),
        MessageType::ConfigurationData => StreamEvent::ConfigurationData(Some(payload(kind, data)?)),
        MessageType::BackupStarted => StreamEvent::BackupStarted(payload(kind, data)?),
        MessageType::BackupProgress => StreamEvent::BackupProgress(payload(kind, data)?),
        MessageType::BackupCompleted => StreamEvent::BackupCompleted(payload(kind, data)?),
        MessageType::BackupFailed => StreamEvent::BackupFailed(payload(kind, data)?),
        MessageType::JobStatusData => match payload(kind, data)? {
            JobStatusPayload::List(jobs) | JobStatusPayload::Wrapped { jobs } => {
                StreamEvent::JobStatusData(jobs)
            }
        },
        MessageType::SshTestResult => StreamEvent::SshTestResult(payload(kind, data)?),
        MessageType::Error => {
            let error = data
                .get("error")
                .or_else(|| data.get("message"))
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| data.to_string());
            StreamEvent::Error { error }
        }
    };

    Ok((event, envelope.timestamp))
}

/// Encode an outbound command frame stamped with the current time.
pub fn encode(command: Command, data: Value) -> Result<String, serde_json::Error> {
    serde_json::to_string(&Envelope {
        kind: command.as_str().to_string(),
        data,
        timestamp: Some(Utc::now().timestamp_millis()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::JobId;

    #[test]
    fn test_decode_progress() {
        let json = r#"{"type":"BACKUP_PROGRESS","data":{"jobId":7,"clientId":"c1","progress":10,"message":"copying"},"timestamp":1709287200000}"#;
        let (event, ts) = decode(json).unwrap();

        assert_eq!(event.kind(), EventKind::BackupProgress);
        assert_eq!(ts, Some(1709287200000));
        match event {
            StreamEvent::BackupProgress(p) => {
                assert_eq!(p.job_id, JobId(7));
                assert_eq!(p.progress, 10);
                assert_eq!(p.message.as_deref(), Some("copying"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_failed() {
        let json = r#"{"type":"BACKUP_FAILED","data":{"jobId":3,"clientId":"c2","error":"rsync exited 23"}}"#;
        let (event, ts) = decode(json).unwrap();
        assert!(ts.is_none());
        match event {
            StreamEvent::BackupFailed(f) => assert_eq!(f.error.as_deref(), Some("rsync exited 23")),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_decode_job_status_shapes() {
        let bare = r#"{"type":"JOB_STATUS_DATA","data":[{"id":1,"clientId":"a","status":"RUNNING"}]}"#;
        let wrapped = r#"{"type":"JOB_STATUS_DATA","data":{"jobs":[{"id":1,"clientId":"a","status":"RUNNING"}]}}"#;

        for json in [bare, wrapped] {
            match decode(json).unwrap().0 {
                StreamEvent::JobStatusData(jobs) => assert_eq!(jobs.len(), 1),
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[test]
    fn test_decode_error_message() {
        let (event, _) = decode(r#"{"type":"ERROR","data":{"error":"client not found"}}"#).unwrap();
        assert_eq!(
            event,
            StreamEvent::Error {
                error: "client not found".into()
            }
        );
    }

    #[test]
    fn test_decode_empty_configuration() {
        let (event, _) = decode(r#"{"type":"CONFIGURATION_DATA","data":null}"#).unwrap();
        assert_eq!(event, StreamEvent::ConfigurationData(None));
    }

    #[test]
    fn test_unknown_type_is_protocol_error() {
        let err = decode(r#"{"type":"HEARTBEAT","data":{}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "HEARTBEAT"));
    }

    #[test]
    fn test_malformed_frames() {
        assert!(matches!(
            decode("not json").unwrap_err(),
            ProtocolError::MalformedEnvelope(_)
        ));
        assert!(matches!(
            decode(r#"{"type":"BACKUP_PROGRESS","data":{"jobId":"x"}}"#).unwrap_err(),
            ProtocolError::InvalidPayload { kind: "BACKUP_PROGRESS", .. }
        ));
    }

    #[test]
    fn test_encode_command() {
        let frame = encode(Command::StartBackup, serde_json::json!({"clientId": "c1"})).unwrap();
        let envelope: Envelope = serde_json::from_str(&frame).unwrap();

        assert_eq!(envelope.kind, "START_BACKUP");
        assert_eq!(envelope.data["clientId"], "c1");
        assert!(envelope.timestamp.is_some());
    }
}
