use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use attendsync_core::Error as CoreError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{message}")]
    BadRequest { code: &'static str, message: String },
    #[error("Invalid webhook signature")]
    Unauthorized,
    #[error("{message}")]
    NotFound { code: &'static str, message: String },
    #[error("{message}")]
    Internal { code: &'static str, message: String },
}

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest {
            code: "malformed_payload",
            message: message.into(),
        }
    }

    pub fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::NotFound {
            code,
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { code, .. }
            | Self::NotFound { code, .. }
            | Self::Internal { code, .. } => *code,
            Self::Unauthorized => "signature_invalid",
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        let code = err.code();
        match err {
            CoreError::MalformedPayload(message) => Self::BadRequest { code, message },
            CoreError::Json(e) => Self::BadRequest {
                code,
                message: e.to_string(),
            },
            CoreError::SignatureInvalid => Self::Unauthorized,
            CoreError::UnknownDomain(domain) => Self::NotFound {
                code,
                message: format!("Unknown sync domain: {}", domain),
            },
            other => Self::Internal {
                code,
                message: other.to_string(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("[Api] {}: {}", self.code(), self);
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_status_codes() {
        let cases = [
            (CoreError::malformed("bad"), StatusCode::BAD_REQUEST),
            (CoreError::SignatureInvalid, StatusCode::UNAUTHORIZED),
            (
                CoreError::UnknownDomain("payroll".to_string()),
                StatusCode::NOT_FOUND,
            ),
            (CoreError::remote("down"), StatusCode::INTERNAL_SERVER_ERROR),
            (
                CoreError::Config("nope".to_string()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status_code(), expected);
        }
    }

    #[test]
    fn json_errors_are_bad_requests() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = ApiError::from(CoreError::from(json_err));
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "json_error");
    }

    #[tokio::test]
    async fn response_body_carries_code_and_message() {
        let response = ApiError::from(CoreError::remote("store offline")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "remote_unavailable");
        assert!(body["message"].as_str().unwrap().contains("store offline"));
    }
}
