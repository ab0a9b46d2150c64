use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use attendsync_core::sync::SyncRunState;

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    signature_validation: bool,
    domains: Vec<SyncRunState>,
}

async fn health(State(state): State<Arc<AppState>>) -> ApiResult<Json<HealthResponse>> {
    let mut domains = Vec::new();
    for domain in state.schedulers.domains() {
        domains.push(state.schedulers.get(domain)?.run_state().await?);
    }
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        signature_validation: state.verifier.is_enabled(),
        domains,
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};

    use crate::api::test_support::{send, test_app};

    #[tokio::test]
    async fn lists_every_domain() {
        let t = test_app(Some("secret"));
        let (status, body) = send(&t.app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["signature_validation"], true);

        let domains = body["domains"].as_array().unwrap();
        let names: Vec<&str> = domains
            .iter()
            .map(|d| d["domain"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["employee", "permit", "presence"]);
        assert!(domains.iter().all(|d| d["health"] == "stopped"));
    }
}
