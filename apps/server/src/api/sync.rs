//! Scheduler control surface for the reconciled domains.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use attendsync_core::sync::{
    ChangeEventType, ChangeResult, CleanupSummary, FieldMap, HealthReport, ReconcileSummary,
    StartOutcome, StopOutcome, SyncDomain, SyncScheduler, SyncStatus,
};

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

#[derive(Debug, Serialize)]
struct StartResponse {
    domain: SyncDomain,
    outcome: StartOutcome,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    domain: SyncDomain,
    outcome: StopOutcome,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntervalRequest {
    #[serde(alias = "interval_seconds")]
    interval_seconds: u64,
}

#[derive(Debug, Serialize)]
struct IntervalResponse {
    domain: SyncDomain,
    interval_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct SimulateRequest {
    event_type: ChangeEventType,
    /// Domain or collection name.
    domain: String,
    document_id: String,
    #[serde(default)]
    document_data: FieldMap,
}

fn scheduler_for(state: &AppState, domain: &str) -> ApiResult<(SyncDomain, Arc<SyncScheduler>)> {
    let domain = domain.parse::<SyncDomain>()?;
    Ok((domain, state.schedulers.get(domain)?))
}

async fn start_sync(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<StartResponse>> {
    let (domain, scheduler) = scheduler_for(&state, &domain)?;
    info!("[Sync] Start requested for {}", domain);
    let outcome = scheduler.start().await?;
    Ok(Json(StartResponse { domain, outcome }))
}

async fn stop_sync(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<StopResponse>> {
    let (domain, scheduler) = scheduler_for(&state, &domain)?;
    info!("[Sync] Stop requested for {}", domain);
    let outcome = scheduler.stop().await?;
    Ok(Json(StopResponse { domain, outcome }))
}

async fn force_sync(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<ReconcileSummary>> {
    let (domain, scheduler) = scheduler_for(&state, &domain)?;
    info!("[Sync] Forced cycle for {}", domain);
    Ok(Json(scheduler.force_sync().await?))
}

async fn cleanup(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<CleanupSummary>> {
    let domain = domain.parse::<SyncDomain>()?;
    info!("[Sync] Cleanup requested for {}", domain);
    Ok(Json(state.engine.cleanup(domain).await?))
}

async fn sync_status(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<SyncStatus>> {
    let (_, scheduler) = scheduler_for(&state, &domain)?;
    Ok(Json(scheduler.status().await?))
}

async fn sync_health(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
) -> ApiResult<Json<HealthReport>> {
    let (_, scheduler) = scheduler_for(&state, &domain)?;
    Ok(Json(scheduler.health_check().await?))
}

async fn set_interval(
    State(state): State<Arc<AppState>>,
    Path(domain): Path<String>,
    Json(body): Json<IntervalRequest>,
) -> ApiResult<Json<IntervalResponse>> {
    let (domain, scheduler) = scheduler_for(&state, &domain)?;
    let interval_seconds = scheduler.set_interval(body.interval_seconds).await?;
    info!("[Sync] {} interval set to {}s", domain, interval_seconds);
    Ok(Json(IntervalResponse {
        domain,
        interval_seconds,
    }))
}

async fn simulate_change(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SimulateRequest>,
) -> ApiResult<Json<ChangeResult>> {
    let domain = body.domain.parse::<SyncDomain>()?;
    if body.document_id.trim().is_empty() {
        return Err(ApiError::bad_request("document_id must not be empty"));
    }
    debug!(
        "[Sync] Simulating {} for {} {}",
        body.event_type, domain, body.document_id
    );
    let result = state
        .change_router
        .simulate_change(body.event_type, domain, &body.document_id, body.document_data)
        .await?;
    Ok(Json(result))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sync/simulate", post(simulate_change))
        .route("/sync/:domain/start", post(start_sync))
        .route("/sync/:domain/stop", post(stop_sync))
        .route("/sync/:domain/force", post(force_sync))
        .route("/sync/:domain/cleanup", post(cleanup))
        .route("/sync/:domain/status", get(sync_status))
        .route("/sync/:domain/health", get(sync_health))
        .route("/sync/:domain/interval", put(set_interval))
}
