//! HTTP routes of the sync service.

use std::sync::Arc;

use axum::Router;

use crate::main_lib::AppState;

mod devices;
mod health;
mod notifications;
mod sync;
mod webhook;

pub fn app_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(health::router())
        .merge(webhook::router())
        .merge(sync::router())
        .merge(notifications::router())
        .merge(devices::router())
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        Router,
    };
    use serde_json::Value;
    use tower::ServiceExt;

    use attendsync_core::cache::InMemoryKeyValueStore;
    use attendsync_core::notifications::{
        InMemoryNotificationRepository, InMemoryRecipientDirectory, InMemoryTokenStore,
        RecipientRef, RecordingPushTransport,
    };
    use attendsync_core::sync::{InMemoryLocalStore, InMemoryRemoteStore, SchedulerConfig};

    use crate::main_lib::{AppState, Collaborators};

    pub struct TestApp {
        pub app: Router,
        pub remote: Arc<InMemoryRemoteStore>,
        pub local: Arc<InMemoryLocalStore>,
        pub tokens: Arc<InMemoryTokenStore>,
        pub jobs: Arc<InMemoryNotificationRepository>,
        pub transport: Arc<RecordingPushTransport>,
    }

    pub fn test_app(webhook_secret: Option<&str>) -> TestApp {
        let remote = Arc::new(InMemoryRemoteStore::new());
        let local = Arc::new(InMemoryLocalStore::new());
        let tokens = Arc::new(InMemoryTokenStore::new());
        let jobs = Arc::new(InMemoryNotificationRepository::new());
        let transport = Arc::new(RecordingPushTransport::new());
        let directory = Arc::new(InMemoryRecipientDirectory::new(vec![
            RecipientRef::Employee("E1".to_string()),
            RecipientRef::Employee("E2".to_string()),
        ]));
        let state = AppState::assemble(
            Collaborators {
                remote: remote.clone(),
                local: local.clone(),
                kv: Arc::new(InMemoryKeyValueStore::new()),
                tokens: tokens.clone(),
                jobs: jobs.clone(),
                transport: transport.clone(),
                directory,
            },
            SchedulerConfig::default(),
            webhook_secret.map(str::to_string),
        );
        TestApp {
            app: super::app_router(state),
            remote,
            local,
            tokens,
            jobs,
            transport,
        }
    }

    pub async fn send(
        app: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        into_parts(app.clone().oneshot(request).await.unwrap()).await
    }

    pub async fn into_parts(response: axum::response::Response) -> (StatusCode, Value) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}
