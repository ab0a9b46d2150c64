//! Change events pushed by the remote store.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde::Serialize;
use tracing::{info, warn};

use attendsync_core::sync::{ChangeEvent, ChangeResult, SIGNATURE_HEADER};

use crate::error::ApiResult;
use crate::main_lib::AppState;

#[derive(Debug, Serialize)]
struct WebhookResponse {
    status: &'static str,
    message: String,
    result: ChangeResult,
}

async fn remote_changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<WebhookResponse>> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok());
    if let Err(err) = state.verifier.verify(&body, signature) {
        warn!("[Webhook] rejected change event: {}", err);
        return Err(err.into());
    }

    let event = ChangeEvent::from_slice(&body)?;
    info!(
        "[Webhook] {} {} {}",
        event.event_type, event.collection, event.document_id
    );
    let result = state.change_router.handle(&event).await?;

    Ok(Json(WebhookResponse {
        status: "success",
        message: format!("{} applied to {}", event.event_type, result.domain),
        result,
    }))
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks/remote-changes", post(remote_changes))
}

#[cfg(test)]
mod tests {
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use hmac::{Hmac, Mac};
    use serde_json::{json, Value};
    use sha2::Sha256;
    use tower::ServiceExt;

    use attendsync_core::notifications::{DeviceToken, RecipientRef, TokenStore};
    use attendsync_core::sync::{LocalStore, SyncDomain};

    use super::*;
    use crate::api::test_support::{into_parts, test_app};

    const SECRET: &str = "webhook-secret";

    fn sign(body: &[u8]) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }

    async fn post_event(
        app: &Router,
        body: &Value,
        signature: Option<String>,
    ) -> (StatusCode, Value) {
        let raw = body.to_string();
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/webhooks/remote-changes")
            .header("content-type", "application/json");
        if let Some(sig) = signature {
            builder = builder.header(SIGNATURE_HEADER, sig);
        }
        let request = builder.body(Body::from(raw)).unwrap();
        into_parts(app.clone().oneshot(request).await.unwrap()).await
    }

    fn employee_event(event_type: &str, name: &str) -> Value {
        json!({
            "event_type": event_type,
            "document_id": "E1",
            "collection": "employees",
            "document_data": { "name": name, "email": "Ana@Example.com", "status": "aktif" }
        })
    }

    #[tokio::test]
    async fn signed_create_event_is_applied() {
        let t = test_app(Some(SECRET));
        let body = employee_event("CREATE", "Ana");
        let (status, json) = post_event(&t.app, &body, Some(sign(body.to_string().as_bytes()))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "success");
        assert_eq!(json["result"]["outcome"], "created");
        let row = t
            .local
            .find_by_stable_id(SyncDomain::Employee, "E1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.fields["email"], json!("ana@example.com"));
    }

    #[tokio::test]
    async fn bad_or_missing_signature_is_unauthorized() {
        let t = test_app(Some(SECRET));
        let body = employee_event("CREATE", "Ana");

        let (status, json) = post_event(&t.app, &body, Some("00ff".to_string())).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "signature_invalid");

        let (status, _) = post_event(&t.app, &body, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(t.local.row_count(SyncDomain::Employee).await, 0);
    }

    #[tokio::test]
    async fn unsigned_events_pass_when_validation_is_disabled() {
        let t = test_app(None);
        let (status, _) = post_event(&t.app, &employee_event("UPDATE", "Ana"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(t.local.row_count(SyncDomain::Employee).await, 1);
    }

    #[tokio::test]
    async fn malformed_bodies_are_bad_requests() {
        let t = test_app(None);
        for body in [
            json!({ "event_type": "CREATE", "document_id": "", "collection": "employees" }),
            json!({ "event_type": "CREATE", "document_id": "X", "collection": "payroll" }),
            json!({ "event_type": "UPSERT", "document_id": "X", "collection": "employees" }),
        ] {
            let (status, json) = post_event(&t.app, &body, None).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
            assert_eq!(json["code"], "malformed_payload");
        }
    }

    #[tokio::test]
    async fn repeated_delivery_is_idempotent() {
        let t = test_app(None);
        let body = employee_event("UPDATE", "Ana");
        post_event(&t.app, &body, None).await;
        let (status, json) = post_event(&t.app, &body, None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"]["outcome"], "no_change");
        assert_eq!(t.local.row_count(SyncDomain::Employee).await, 1);
        assert_eq!(t.local.write_back_count().await, 0);
    }

    #[tokio::test]
    async fn delete_marks_row_inactive() {
        let t = test_app(None);
        post_event(&t.app, &employee_event("CREATE", "Ana"), None).await;
        let (status, json) = post_event(&t.app, &employee_event("DELETE", "Ana"), None).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"]["outcome"], "deactivated");
        let row = t
            .local
            .find_by_stable_id(SyncDomain::Employee, "E1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.fields["status"], json!("non-aktif"));
        assert_eq!(json["result"]["record"]["stable_id"], "E1");
        assert_eq!(json["result"]["record"]["local_ref"], json!(row.local_id));
        assert_eq!(json["result"]["record"]["fields"]["status"], "non-aktif");
    }

    #[tokio::test]
    async fn permit_status_change_notifies_employee() {
        let t = test_app(None);
        let now = chrono::Utc::now();
        t.tokens
            .add_token(&DeviceToken {
                recipient: RecipientRef::Employee("E1".to_string()),
                device_id: "phone".to_string(),
                token: "tok-1".to_string(),
                platform: "android".to_string(),
                created_at: now,
                last_used_at: now,
            })
            .await
            .unwrap();

        let permit = |status: &str| {
            json!({
                "event_type": "UPDATE",
                "document_id": "P1",
                "collection": "permits",
                "document_data": {
                    "employee_id": "E1",
                    "permit_type": "Sick",
                    "start_date": "2026-03-02",
                    "end_date": "2026-03-03",
                    "status": status
                }
            })
        };
        post_event(&t.app, &permit("pending"), None).await;
        assert!(t.transport.sent().await.is_empty());

        let (status, json) = post_event(&t.app, &permit("approved"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["result"]["outcome"], "updated");

        let sent = t.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].token, "tok-1");
        assert_eq!(sent[0].data["status"], "approved");
    }
}
