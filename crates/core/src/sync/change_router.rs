//! Applies single-record CREATE/UPDATE/DELETE events pushed from the remote side.

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::domain::{DomainSpec, FieldMap, LocalRow, SyncDomain, SyncedDomainRecord};
use super::reconcile::{apply_to_existing, create_from_remote, ApplyOutcome};
use super::stores::LocalStore;
use crate::errors::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeEventType {
    Create,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        })
    }
}

/// Webhook body describing one remote document change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: ChangeEventType,
    pub document_id: String,
    #[serde(default)]
    pub document_data: FieldMap,
    #[serde(default)]
    pub old_document_data: Option<FieldMap>,
    pub collection: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ChangeEvent {
    /// Parses and validates a raw webhook body.
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        let event: ChangeEvent = serde_json::from_slice(body)
            .map_err(|e| Error::malformed(format!("invalid change event: {}", e)))?;
        if event.document_id.trim().is_empty() {
            return Err(Error::malformed("document_id must not be empty"));
        }
        event.domain()?;
        Ok(event)
    }

    pub fn domain(&self) -> Result<SyncDomain> {
        self.collection
            .parse::<SyncDomain>()
            .map_err(|_| Error::malformed(format!("unknown collection '{}'", self.collection)))
    }
}

/// What a change event did to the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ChangeOutcome {
    Created { local_id: i64 },
    Updated { changed: Vec<String> },
    NoChange,
    Deactivated,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeResult {
    pub domain: SyncDomain,
    pub stable_id: String,
    pub event_type: ChangeEventType,
    #[serde(flatten)]
    pub outcome: ChangeOutcome,
    /// Local state after the change; absent when no row exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record: Option<SyncedDomainRecord>,
}

/// Row state around an applied change, handed to listeners.
#[derive(Debug, Clone)]
pub struct AppliedChange {
    pub result: ChangeResult,
    /// Local fields before the change; `None` when the row did not exist.
    pub previous: Option<FieldMap>,
    /// Local fields after the change; `None` when no row exists.
    pub current: Option<FieldMap>,
}

impl AppliedChange {
    /// Local column whose value differs between `previous` and `current`.
    pub fn changed_value(&self, column: &str) -> Option<&serde_json::Value> {
        let current = self.current.as_ref()?.get(column)?;
        let previous = self.previous.as_ref().and_then(|p| p.get(column));
        match previous {
            Some(prev) if super::domain::values_equivalent(prev, current) => None,
            _ => Some(current),
        }
    }
}

/// Hook invoked after every successfully applied change.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, change: &AppliedChange);
}

pub struct ChangeEventRouter {
    local: Arc<dyn LocalStore>,
    listeners: Vec<Arc<dyn ChangeListener>>,
}

impl ChangeEventRouter {
    pub fn new(local: Arc<dyn LocalStore>) -> Self {
        Self {
            local,
            listeners: Vec::new(),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn ChangeListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub async fn handle(&self, event: &ChangeEvent) -> Result<ChangeResult> {
        let domain = event.domain()?;
        let stable_id = event.document_id.trim();
        if stable_id.is_empty() {
            return Err(Error::malformed("document_id must not be empty"));
        }
        let spec = DomainSpec::for_domain(domain);
        let existing = self.local.find_by_stable_id(domain, stable_id).await?;
        let previous = existing.as_ref().map(|row| row.fields.clone());

        let (outcome, current) = match (event.event_type, existing) {
            (ChangeEventType::Create | ChangeEventType::Update, Some(row)) => {
                self.apply_update(&spec, row, &event.document_data).await?
            }
            (ChangeEventType::Create | ChangeEventType::Update, None) => {
                self.apply_create(&spec, stable_id, &event.document_data)
                    .await?
            }
            (ChangeEventType::Delete, Some(row)) => self.apply_delete(&spec, row).await?,
            (ChangeEventType::Delete, None) => (ChangeOutcome::NotFound, None),
        };

        let record = current
            .as_ref()
            .map(|row| SyncedDomainRecord::from_local(domain, row));
        let result = ChangeResult {
            domain,
            stable_id: stable_id.to_string(),
            event_type: event.event_type,
            outcome,
            record,
        };
        info!(
            "[ChangeRouter] {} {} {} -> {:?}",
            event.event_type, domain, stable_id, result.outcome
        );

        if !self.listeners.is_empty() {
            let applied = AppliedChange {
                result: result.clone(),
                previous,
                current: current.map(|row| row.fields),
            };
            for listener in &self.listeners {
                listener.on_change(&applied).await;
            }
        }
        Ok(result)
    }

    /// Builds a synthetic event and routes it like a webhook delivery.
    pub async fn simulate_change(
        &self,
        event_type: ChangeEventType,
        domain: SyncDomain,
        document_id: &str,
        data: FieldMap,
    ) -> Result<ChangeResult> {
        let event = ChangeEvent {
            event_type,
            document_id: document_id.to_string(),
            document_data: data,
            old_document_data: None,
            collection: domain.collection().to_string(),
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        };
        debug!("[ChangeRouter] simulating {} for {} {}", event_type, domain, document_id);
        self.handle(&event).await
    }

    async fn apply_update(
        &self,
        spec: &DomainSpec,
        row: LocalRow,
        data: &FieldMap,
    ) -> Result<(ChangeOutcome, Option<LocalRow>)> {
        match apply_to_existing(self.local.as_ref(), spec, &row, data).await? {
            ApplyOutcome::Updated { changed } => {
                let columns = changed.keys().cloned().collect();
                let mut row = row;
                row.fields.extend(changed);
                Ok((ChangeOutcome::Updated { changed: columns }, Some(row)))
            }
            _ => Ok((ChangeOutcome::NoChange, Some(row))),
        }
    }

    async fn apply_create(
        &self,
        spec: &DomainSpec,
        stable_id: &str,
        data: &FieldMap,
    ) -> Result<(ChangeOutcome, Option<LocalRow>)> {
        match create_from_remote(self.local.as_ref(), spec, stable_id, data).await {
            Ok(row) => Ok((
                ChangeOutcome::Created {
                    local_id: row.local_id,
                },
                Some(row),
            )),
            Err(err) => {
                // A concurrent delivery may have created the row first.
                match self.local.find_by_stable_id(spec.domain, stable_id).await? {
                    Some(row) => self.apply_update(spec, row, data).await,
                    None => Err(err),
                }
            }
        }
    }

    async fn apply_delete(
        &self,
        spec: &DomainSpec,
        row: LocalRow,
    ) -> Result<(ChangeOutcome, Option<LocalRow>)> {
        if spec.is_inactive(&row.fields) {
            return Ok((ChangeOutcome::NoChange, Some(row)));
        }
        self.local
            .mark_inactive(spec.domain, &row)
            .await
            .map_err(|e| Error::record_apply(&row.stable_id, e.to_string()))?;
        let mut row = row;
        row.fields.insert(
            spec.status_column.to_string(),
            serde_json::Value::String(spec.inactive_status.to_string()),
        );
        Ok((ChangeOutcome::Deactivated, Some(row)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::InMemoryLocalStore;
    use serde_json::json;
    use tokio::sync::Mutex;

    fn fields(value: serde_json::Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    fn router() -> (ChangeEventRouter, Arc<InMemoryLocalStore>) {
        let local = Arc::new(InMemoryLocalStore::new());
        (ChangeEventRouter::new(local.clone()), local)
    }

    #[tokio::test]
    async fn duplicate_create_produces_one_row() {
        let (router, local) = router();
        let data = fields(json!({ "name": "Alice", "status": "aktif" }));
        let first = router
            .simulate_change(ChangeEventType::Create, SyncDomain::Employee, "E1", data.clone())
            .await
            .unwrap();
        let second = router
            .simulate_change(ChangeEventType::Create, SyncDomain::Employee, "E1", data)
            .await
            .unwrap();

        assert!(matches!(first.outcome, ChangeOutcome::Created { .. }));
        assert_eq!(second.outcome, ChangeOutcome::NoChange);
        assert_eq!(local.row_count(SyncDomain::Employee).await, 1);
    }

    #[tokio::test]
    async fn update_without_row_creates_it() {
        let (router, local) = router();
        let result = router
            .simulate_change(
                ChangeEventType::Update,
                SyncDomain::Permit,
                "P1",
                fields(json!({ "employee_id": "E1", "status": "pending" })),
            )
            .await
            .unwrap();
        assert!(matches!(result.outcome, ChangeOutcome::Created { .. }));
        let row = local
            .find_by_stable_id(SyncDomain::Permit, "P1")
            .await
            .unwrap()
            .expect("row");
        assert_eq!(row.fields.get("employee_stable_id"), Some(&json!("E1")));
    }

    #[tokio::test]
    async fn update_reports_changed_columns_and_stays_quiet() {
        let (router, local) = router();
        local
            .create(
                SyncDomain::Employee,
                "E1",
                fields(json!({ "name": "Alice", "email": null })),
            )
            .await
            .unwrap();
        let result = router
            .simulate_change(
                ChangeEventType::Update,
                SyncDomain::Employee,
                "E1",
                fields(json!({ "name": "Alicia", "email": "" })),
            )
            .await
            .unwrap();
        assert_eq!(
            result.outcome,
            ChangeOutcome::Updated {
                changed: vec!["name".to_string()]
            }
        );
        assert_eq!(local.write_back_count().await, 0);
    }

    #[tokio::test]
    async fn delete_soft_removes_and_missing_row_is_not_found() {
        let (router, local) = router();
        router
            .simulate_change(
                ChangeEventType::Create,
                SyncDomain::Employee,
                "E1",
                fields(json!({ "name": "Alice", "status": "aktif" })),
            )
            .await
            .unwrap();

        let deleted = router
            .simulate_change(ChangeEventType::Delete, SyncDomain::Employee, "E1", FieldMap::new())
            .await
            .unwrap();
        assert_eq!(deleted.outcome, ChangeOutcome::Deactivated);
        let row = local
            .find_by_stable_id(SyncDomain::Employee, "E1")
            .await
            .unwrap()
            .expect("row still queryable");
        assert_eq!(row.fields.get("status"), Some(&json!("non-aktif")));
        let record = deleted.record.expect("record after delete");
        assert_eq!(record.local_ref, Some(row.local_id));
        assert_eq!(record.stable_id, "E1");
        assert_eq!(record.fields.get("status"), Some(&json!("non-aktif")));

        let missing = router
            .simulate_change(ChangeEventType::Delete, SyncDomain::Employee, "E9", FieldMap::new())
            .await
            .unwrap();
        assert_eq!(missing.outcome, ChangeOutcome::NotFound);
        assert!(missing.record.is_none());
    }

    #[test]
    fn malformed_bodies_are_rejected() {
        assert!(matches!(
            ChangeEvent::from_slice(b"not json"),
            Err(Error::MalformedPayload(_))
        ));
        let unknown = br#"{"event_type":"CREATE","document_id":"X","collection":"payroll"}"#;
        assert!(matches!(
            ChangeEvent::from_slice(unknown),
            Err(Error::MalformedPayload(_))
        ));
        let bad_type = br#"{"event_type":"UPSERT","document_id":"X","collection":"employees"}"#;
        assert!(ChangeEvent::from_slice(bad_type).is_err());

        let ok = br#"{"event_type":"DELETE","document_id":"E1","collection":"employees","timestamp":"2026-01-01T00:00:00Z"}"#;
        let event = ChangeEvent::from_slice(ok).unwrap();
        assert_eq!(event.event_type, ChangeEventType::Delete);
        assert!(event.document_data.is_empty());
    }

    struct Recorder(Mutex<Vec<AppliedChange>>);

    #[async_trait]
    impl ChangeListener for Recorder {
        async fn on_change(&self, change: &AppliedChange) {
            self.0.lock().await.push(change.clone());
        }
    }

    #[tokio::test]
    async fn listener_sees_previous_and_current_fields() {
        let local = Arc::new(InMemoryLocalStore::new());
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let router = ChangeEventRouter::new(local.clone()).with_listener(recorder.clone());
        local
            .create(
                SyncDomain::Permit,
                "P1",
                fields(json!({ "employee_stable_id": "E1", "status": "pending" })),
            )
            .await
            .unwrap();

        router
            .simulate_change(
                ChangeEventType::Update,
                SyncDomain::Permit,
                "P1",
                fields(json!({ "employee_id": "E1", "status": "approved" })),
            )
            .await
            .unwrap();

        let seen = recorder.0.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].changed_value("status"), Some(&json!("approved")));
        assert_eq!(seen[0].changed_value("employee_stable_id"), None);
    }
}
