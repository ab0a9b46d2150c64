//! Error types shared by the reconciliation and notification services.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage-level failures reported by `LocalStore`, job and key-value implementations.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Internal database error: {0}")]
    Internal(String),
}

/// Errors raised by the sync and notification core.
#[derive(Debug, Error)]
pub enum Error {
    /// Transport or auth failure while reading the remote store. Retried by the
    /// scheduler backoff, never fatal to the process.
    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// Applying a single record to the local store failed.
    #[error("Failed to apply record '{stable_id}': {message}")]
    RecordApply { stable_id: String, message: String },

    /// A remote record carried no identity key.
    #[error("Record at position {position} has no stable id")]
    StableIdMissing { position: usize },

    /// Push send failed.
    #[error("Push transport failure: {0}")]
    Transport(String),

    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// Missing or invalid configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown sync domain '{0}'")]
    UnknownDomain(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteUnavailable(message.into())
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedPayload(message.into())
    }

    pub fn record_apply(stable_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::RecordApply {
            stable_id: stable_id.into(),
            message: message.into(),
        }
    }

    /// Short machine-readable code used in summaries and API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RemoteUnavailable(_) => "remote_unavailable",
            Self::RecordApply { .. } => "record_apply_error",
            Self::StableIdMissing { .. } => "stable_id_missing",
            Self::Transport(_) => "transport_failure",
            Self::SignatureInvalid => "signature_invalid",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::Config(_) => "config_error",
            Self::UnknownDomain(_) => "unknown_domain",
            Self::Database(_) => "database_error",
            Self::Json(_) => "json_error",
        }
    }
}
