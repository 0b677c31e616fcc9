//! Error types shared across the monitor.
//!
//! Transport and protocol failures never leave the `stream` module; they are
//! logged and handled there. REST failures surface as [`ApiError`] and the
//! start workflow wraps them in [`StartError`].

use thiserror::Error;

/// Errors returned by the REST collaborator.
#[derive(Error, Debug)]
pub enum ApiError {
    /// The backend answered with a non-success HTTP status.
    #[error("backend returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Network-level request failure with context.
    #[error("{context}: {source}")]
    Network {
        context: String,
        source: reqwest::Error,
    },

    #[error("invalid API URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    /// The response was missing expected fields.
    #[error("{0}")]
    InvalidResponse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors returned by [`BackupInitiator::start`](crate::core::BackupInitiator::start).
#[derive(Error, Debug)]
pub enum StartError {
    /// A start request (or the job it created) is still outstanding for this client.
    #[error("a backup is already in progress for client {client_id}")]
    AlreadyInProgress { client_id: String },

    #[error("failed to start backup: {0}")]
    Request(#[from] ApiError),
}

/// Push connection failures. Retried by the stream client, never returned to callers.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("connection closed")]
    Closed,
}

/// Inbound messages the stream client cannot use. Logged and dropped.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(serde_json::Error),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        source: serde_json::Error,
    },
}

/// Convenience alias for REST results.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
