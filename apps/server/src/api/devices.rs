use std::sync::Arc;

use axum::{extract::State, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::info;

use attendsync_core::notifications::{DeviceToken, RecipientRef};

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Deserialize)]
struct RegisterTokenRequest {
    recipient: String,
    device_id: String,
    token: String,
    #[serde(default)]
    platform: String,
}

#[derive(Debug, Deserialize)]
struct RemoveTokenRequest {
    recipient: String,
    device_id: String,
}

#[derive(Debug, Serialize)]
struct RemoveTokenResponse {
    removed: bool,
}

async fn register_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterTokenRequest>,
) -> ApiResult<Json<DeviceToken>> {
    let recipient = RecipientRef::parse(&body.recipient)?;
    let token = state
        .dispatcher
        .register_token(&recipient, &body.device_id, &body.token, &body.platform)
        .await?;
    info!(
        "[Devices] Registered {} token for {} device {}",
        token.platform, recipient, token.device_id
    );
    Ok(Json(token))
}

async fn remove_token(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RemoveTokenRequest>,
) -> ApiResult<Json<RemoveTokenResponse>> {
    let recipient = RecipientRef::parse(&body.recipient)?;
    state
        .dispatcher
        .remove_token(&recipient, body.device_id.trim())
        .await?;
    info!("[Devices] Removed token for {} device {}", recipient, body.device_id);
    Ok(Json(RemoveTokenResponse { removed: true }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/devices/tokens", post(register_token).delete(remove_token))
}
