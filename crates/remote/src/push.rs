//! HTTP push transport.
//!
//! `POST {push_url}` with the `PushMessage` JSON body. A 2xx response carries
//! `{accepted, message_id, error_code}`; any other status is a rejection of
//! that one message. Only failures to reach the service are errors.

use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;

use attendsync_core::notifications::{PushMessage, PushResponse, PushTransport};

use crate::client::{api_error, bearer_headers, log_response, DEFAULT_TIMEOUT_SECS};
use crate::error::{RemoteError, Result};
use crate::types::{ApiErrorResponse, PushSendResponse};

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub url: String,
    pub server_key: Option<String>,
    pub timeout: Duration,
}

impl PushConfig {
    pub fn new(url: impl Into<String>, server_key: Option<String>) -> Self {
        Self {
            url: url.into(),
            server_key: server_key.filter(|k| !k.trim().is_empty()),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpPushTransport {
    client: reqwest::Client,
    config: PushConfig,
}

impl HttpPushTransport {
    pub fn new(config: PushConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    async fn post(&self, message: &PushMessage) -> Result<PushResponse> {
        let response = self
            .client
            .post(&self.config.url)
            .headers(bearer_headers(self.config.server_key.as_deref())?)
            .json(message)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        log_response("Push", status, &body);

        if !status.is_success() {
            let code = serde_json::from_str::<ApiErrorResponse>(&body)
                .map(|e| e.code)
                .unwrap_or_else(|_| format!("HTTP_{}", status.as_u16()));
            warn!("[Push] rejected with {}: {}", code, api_error(status, &body));
            return Ok(PushResponse::rejected(code));
        }

        let parsed: PushSendResponse = serde_json::from_str(&body).map_err(RemoteError::from)?;
        // A 2xx without an explicit flag counts as accepted.
        if parsed.accepted.unwrap_or(true) {
            Ok(PushResponse {
                accepted: true,
                message_id: parsed.message_id,
                error_code: None,
            })
        } else {
            Ok(PushResponse::rejected(
                parsed.error_code.unwrap_or_else(|| "REJECTED".to_string()),
            ))
        }
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn send(&self, message: &PushMessage) -> attendsync_core::Result<PushResponse> {
        debug!("[Push] sending '{}' ({})", message.title, message.priority);
        self.post(message)
            .await
            .map_err(|err| attendsync_core::Error::Transport(err.to_string()))
    }
}
