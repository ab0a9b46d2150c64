use std::sync::Arc;

use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use attendsync_core::notifications::{
    DispatchOptions, DispatchSummary, NotificationContent, NotificationJob, ProcessDueSummary,
    RecipientDispatch, RecipientRef,
};
use attendsync_core::sync::FieldMap;

use crate::error::{ApiError, ApiResult};
use crate::main_lib::AppState;

/// Notification content as posted by callers. `data` values are coerced to strings.
#[derive(Debug, Deserialize)]
struct ContentBody {
    title: String,
    body: String,
    #[serde(default)]
    data: FieldMap,
    #[serde(default)]
    options: DispatchOptions,
}

impl ContentBody {
    fn into_content(self) -> ApiResult<NotificationContent> {
        if self.title.trim().is_empty() {
            return Err(ApiError::bad_request("title must not be empty"));
        }
        Ok(NotificationContent::new(
            self.title,
            self.body,
            &self.data,
            self.options,
        ))
    }
}

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    /// `employee:<id>` or `user:<id>`.
    recipient: String,
    #[serde(flatten)]
    content: ContentBody,
}

#[derive(Debug, Deserialize)]
struct DispatchManyRequest {
    recipients: Vec<String>,
    #[serde(flatten)]
    content: ContentBody,
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    recipient: String,
    due_at: DateTime<Utc>,
    #[serde(flatten)]
    content: ContentBody,
}

#[derive(Debug, Serialize)]
struct ReadResponse {
    id: String,
    read: bool,
}

async fn dispatch(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DispatchRequest>,
) -> ApiResult<Json<RecipientDispatch>> {
    let recipient = RecipientRef::parse(&body.recipient)?;
    let content = body.content.into_content()?;
    info!("[Notifications] Dispatch '{}' to {}", content.title, recipient);
    let result = state
        .dispatcher
        .dispatch_to_recipient(&recipient, &content)
        .await?;
    Ok(Json(result))
}

async fn dispatch_many(
    State(state): State<Arc<AppState>>,
    Json(body): Json<DispatchManyRequest>,
) -> ApiResult<Json<DispatchSummary>> {
    let recipients = body
        .recipients
        .iter()
        .map(|r| RecipientRef::parse(r))
        .collect::<Result<Vec<_>, _>>()?;
    let content = body.content.into_content()?;
    info!(
        "[Notifications] Dispatch '{}' to {} recipients",
        content.title,
        recipients.len()
    );
    Ok(Json(
        state.dispatcher.dispatch_to_many(&recipients, &content).await,
    ))
}

async fn broadcast(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContentBody>,
) -> ApiResult<Json<DispatchSummary>> {
    let content = body.into_content()?;
    info!("[Notifications] Broadcast '{}'", content.title);
    Ok(Json(state.dispatcher.dispatch_to_all(&content).await?))
}

async fn schedule(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ScheduleRequest>,
) -> ApiResult<Json<NotificationJob>> {
    let recipient = RecipientRef::parse(&body.recipient)?;
    let content = body.content.into_content()?;
    let job = state
        .dispatcher
        .schedule_notification(&recipient, &content, body.due_at)
        .await?;
    Ok(Json(job))
}

async fn process_due(State(state): State<Arc<AppState>>) -> ApiResult<Json<ProcessDueSummary>> {
    Ok(Json(state.dispatcher.process_due().await?))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ReadResponse>> {
    if !state.dispatcher.mark_read(&id).await? {
        return Err(ApiError::not_found(
            "notification_not_found",
            format!("Notification {} not found", id),
        ));
    }
    Ok(Json(ReadResponse { id, read: true }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/notifications/dispatch", post(dispatch))
        .route("/notifications/dispatch-many", post(dispatch_many))
        .route("/notifications/broadcast", post(broadcast))
        .route("/notifications/schedule", post(schedule))
        .route("/notifications/process-due", post(process_due))
        .route("/notifications/:id/read", post(mark_read))
}

#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use chrono::Duration;
    use serde_json::json;

    use attendsync_core::notifications::{DeviceToken, JobStatus, NotificationRepository, TokenStore};

    use crate::api::test_support::{send, test_app, TestApp};

    use super::*;

    async fn register(t: &TestApp, recipient: &str, device: &str, token: &str) {
        let now = Utc::now();
        t.tokens
            .add_token(&DeviceToken {
                recipient: RecipientRef::parse(recipient).unwrap(),
                device_id: device.to_string(),
                token: token.to_string(),
                platform: "ios".to_string(),
                created_at: now,
                last_used_at: now,
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn dispatch_sends_to_each_device_and_suppresses_repeat() {
        let t = test_app(None);
        register(&t, "employee:E1", "phone", "tok-a").await;
        register(&t, "employee:E1", "tablet", "tok-b").await;
        let request = json!({
            "recipient": "employee:E1",
            "title": "Shift reminder",
            "body": "Check in before 08:00",
            "data": { "date": "2026-03-02", "shift": 1 },
            "options": { "type": "attendance_reminder" }
        });

        let (status, body) =
            send(&t.app, Method::POST, "/notifications/dispatch", Some(request.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(body["tokens"].as_array().unwrap().len(), 2);

        let (_, body) = send(&t.app, Method::POST, "/notifications/dispatch", Some(request)).await;
        assert_eq!(body["status"], "suppressed");
        assert_eq!(body["success"], true);
        assert_eq!(t.transport.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn dispatch_without_tokens_stores_job() {
        let t = test_app(None);
        let (status, body) = send(
            &t.app,
            Method::POST,
            "/notifications/dispatch",
            Some(json!({ "recipient": "user:42", "title": "Hello", "body": "World" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "stored");
        assert_eq!(t.jobs.count_with_status(JobStatus::Pending).await, 1);
    }

    #[tokio::test]
    async fn invalid_recipient_is_bad_request() {
        let t = test_app(None);
        let (status, body) = send(
            &t.app,
            Method::POST,
            "/notifications/dispatch",
            Some(json!({ "recipient": "robot:1", "title": "Hi", "body": "x" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "malformed_payload");
    }

    #[tokio::test]
    async fn dispatch_many_and_broadcast_report_per_recipient() {
        let t = test_app(None);
        register(&t, "employee:E1", "phone", "tok-a").await;
        t.transport.reject_token("tok-a").await;

        let (status, body) = send(
            &t.app,
            Method::POST,
            "/notifications/dispatch-many",
            Some(json!({
                "recipients": ["employee:E1", "employee:E2"],
                "title": "Memo",
                "body": "Read it",
                "options": { "skip_dedup": true }
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
        assert_eq!(body["failed"], 1);
        assert_eq!(body["succeeded"], 1);

        let (status, body) = send(
            &t.app,
            Method::POST,
            "/notifications/broadcast",
            Some(json!({ "title": "Office closed", "body": "Friday", "options": { "type": "announcement" } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total"], 2);
    }

    #[tokio::test]
    async fn scheduled_job_is_sent_once_when_due() {
        let t = test_app(None);
        register(&t, "employee:E1", "phone", "tok-a").await;
        let due_at = Utc::now() - Duration::seconds(5);
        let (status, job) = send(
            &t.app,
            Method::POST,
            "/notifications/schedule",
            Some(json!({
                "recipient": "employee:E1",
                "due_at": due_at.to_rfc3339(),
                "title": "Later",
                "body": "Now"
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(job["status"], "scheduled");

        let (_, first) = send(&t.app, Method::POST, "/notifications/process-due", None).await;
        assert_eq!(first["claimed"], 1);
        assert_eq!(first["sent"], 1);

        let (_, second) = send(&t.app, Method::POST, "/notifications/process-due", None).await;
        assert_eq!(second["claimed"], 0);
        assert_eq!(t.transport.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn mark_read_stamps_job_and_rejects_unknown_id() {
        let t = test_app(None);
        let (_, dispatched) = send(
            &t.app,
            Method::POST,
            "/notifications/dispatch",
            Some(json!({ "recipient": "employee:E9", "title": "Hi", "body": "There" })),
        )
        .await;
        let id = dispatched["job_ids"][0].as_str().unwrap().to_string();

        let (status, body) =
            send(&t.app, Method::POST, &format!("/notifications/{}/read", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["read"], true);
        let job = t.jobs.get(&id).await.unwrap().unwrap();
        assert!(job.read_at.is_some());
        assert_eq!(job.status, JobStatus::Pending);

        let (status, body) =
            send(&t.app, Method::POST, "/notifications/missing/read", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "notification_not_found");
    }
}
