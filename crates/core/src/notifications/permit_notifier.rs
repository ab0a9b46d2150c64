//! Notifies an employee when one of their permits changes status.

use async_trait::async_trait;
use log::{debug, info};
use std::sync::Arc;

use super::dispatch::NotificationDispatchEngine;
use super::model::{DispatchOptions, NotificationContent, Payload, Priority, RecipientRef};
use crate::sync::{value_to_string, AppliedChange, ChangeListener, ChangeOutcome, SyncDomain};

pub const STATUS_CHANGED_KIND: &str = "status_changed";
pub const PERMIT_STATUS_ACTION: &str = "permit_status";

/// `ChangeListener` that dispatches a `status_changed` notification for
/// permit status transitions.
pub struct PermitStatusNotifier {
    dispatcher: Arc<NotificationDispatchEngine>,
}

impl PermitStatusNotifier {
    pub fn new(dispatcher: Arc<NotificationDispatchEngine>) -> Self {
        Self { dispatcher }
    }

    /// Builds the notification for a change, or `None` when the change is not
    /// a status transition of an existing permit.
    pub fn notification_for(change: &AppliedChange) -> Option<(RecipientRef, NotificationContent)> {
        if change.result.domain != SyncDomain::Permit {
            return None;
        }
        if !matches!(
            change.result.outcome,
            ChangeOutcome::Updated { .. } | ChangeOutcome::Deactivated
        ) {
            return None;
        }
        let status = change.changed_value("status").map(value_to_string)?;
        let current = change.current.as_ref()?;
        let employee_id = current
            .get("employee_stable_id")
            .map(value_to_string)
            .filter(|id| !id.trim().is_empty())?;

        let field = |key: &str| current.get(key).map(value_to_string).unwrap_or_default();
        let permit_type = field("permit_type");

        let mut payload = Payload::new();
        payload.insert("entity".to_string(), "permit".to_string());
        payload.insert("permit_id".to_string(), change.result.stable_id.clone());
        payload.insert("employee_id".to_string(), employee_id.clone());
        payload.insert("status".to_string(), status.clone());
        payload.insert("permit_type".to_string(), permit_type.clone());
        payload.insert("start_date".to_string(), field("start_date"));
        payload.insert("end_date".to_string(), field("end_date"));

        let label = if permit_type.is_empty() {
            "permit".to_string()
        } else {
            format!("{} permit", permit_type)
        };
        let content = NotificationContent {
            title: "Permit status updated".to_string(),
            body: format!("Your {} is now {}", label, status),
            payload,
            options: DispatchOptions::kind(STATUS_CHANGED_KIND)
                .with_action(PERMIT_STATUS_ACTION)
                .with_priority(Priority::High),
        };
        Some((RecipientRef::Employee(employee_id), content))
    }
}

#[async_trait]
impl ChangeListener for PermitStatusNotifier {
    async fn on_change(&self, change: &AppliedChange) {
        let Some((recipient, content)) = Self::notification_for(change) else {
            return;
        };
        debug!(
            "[Dispatch] permit {} status change for {}",
            change.result.stable_id, recipient
        );
        match self.dispatcher.dispatch_to_recipient(&recipient, &content).await {
            Ok(result) => info!(
                "[Dispatch] permit {} notification: {:?}",
                change.result.stable_id, result.status
            ),
            Err(err) => log::error!(
                "[Dispatch] permit {} notification failed: {}",
                change.result.stable_id,
                err
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryKeyValueStore;
    use crate::notifications::dedup::{DedupConfig, DuplicateSuppressor};
    use crate::notifications::dispatch::{DispatchConfig, DispatchStores};
    use crate::notifications::memory::{
        InMemoryNotificationRepository, InMemoryRecipientDirectory, InMemoryTokenStore,
        RecordingPushTransport,
    };
    use crate::notifications::model::DeviceToken;
    use crate::notifications::stores::TokenStore;
    use crate::sync::{ChangeEventRouter, ChangeEventType, FieldMap, InMemoryLocalStore, LocalStore};
    use chrono::Utc;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn permit_status_change_notifies_employee_once() {
        let tokens = Arc::new(InMemoryTokenStore::new());
        let jobs = Arc::new(InMemoryNotificationRepository::new());
        let transport = Arc::new(RecordingPushTransport::new());
        let now = Utc::now();
        tokens
            .add_token(&DeviceToken {
                recipient: RecipientRef::Employee("E1".to_string()),
                device_id: "phone".to_string(),
                token: "tok-a".to_string(),
                platform: "android".to_string(),
                created_at: now,
                last_used_at: now,
            })
            .await
            .unwrap();

        let dispatcher = Arc::new(
            NotificationDispatchEngine::new(
                DispatchStores {
                    tokens,
                    jobs: jobs.clone(),
                    transport: transport.clone(),
                    directory: Arc::new(InMemoryRecipientDirectory::default()),
                },
                DispatchConfig::default(),
            )
            .with_suppressor(DuplicateSuppressor::new(
                Arc::new(InMemoryKeyValueStore::new()),
                jobs.clone(),
                DedupConfig::default(),
            )),
        );

        let local = Arc::new(InMemoryLocalStore::new());
        local
            .create(
                SyncDomain::Permit,
                "P1",
                fields(json!({ "employee_stable_id": "E1", "permit_type": "sakit", "status": "pending" })),
            )
            .await
            .unwrap();
        let router = ChangeEventRouter::new(local)
            .with_listener(Arc::new(PermitStatusNotifier::new(dispatcher)));

        let approved = fields(json!({ "employee_id": "E1", "permit_type": "sakit", "status": "approved" }));
        router
            .simulate_change(ChangeEventType::Update, SyncDomain::Permit, "P1", approved.clone())
            .await
            .unwrap();
        // Replayed delivery: no status change, nothing sent.
        router
            .simulate_change(ChangeEventType::Update, SyncDomain::Permit, "P1", approved)
            .await
            .unwrap();

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].body, "Your sakit permit is now approved");
        assert_eq!(sent[0].data.get("status").map(String::as_str), Some("approved"));
        assert_eq!(jobs.all().await.len(), 1);
    }

    #[tokio::test]
    async fn created_permits_and_other_domains_are_ignored() {
        let local = Arc::new(InMemoryLocalStore::new());
        let router = ChangeEventRouter::new(local);
        let created = router
            .simulate_change(
                ChangeEventType::Create,
                SyncDomain::Permit,
                "P2",
                fields(json!({ "employee_id": "E1", "status": "pending" })),
            )
            .await
            .unwrap();
        let change = AppliedChange {
            result: created,
            previous: None,
            current: Some(fields(json!({ "employee_stable_id": "E1", "status": "pending" }))),
        };
        assert!(PermitStatusNotifier::notification_for(&change).is_none());
    }
}
