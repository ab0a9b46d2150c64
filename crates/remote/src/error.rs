//! Error types for the remote document store and push clients.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Non-2xx response. `message` carries the service's error code when the
    /// body had one.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// The configured token cannot be used as a header value.
    #[error("Authentication error: {0}")]
    Auth(String),
}

impl RemoteError {
    pub fn api(status: u16, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth(message.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api { status: 404, .. })
    }

    /// The service refused the credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Auth(_) | Self::Api { status: 401 | 403, .. })
    }
}

/// Remote failures, rejected credentials included, are `RemoteUnavailable`
/// to the core. A cycle that hits one backs off and retries.
impl From<RemoteError> for attendsync_core::Error {
    fn from(err: RemoteError) -> Self {
        if err.is_unauthorized() {
            log::warn!("[RemoteStore] credentials rejected: {}", err);
        }
        attendsync_core::Error::remote(err.to_string())
    }
}
