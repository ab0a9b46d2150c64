//! Full-scan reconciliation of one domain from the remote store into the local store.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use super::domain::{DomainSpec, FieldMap, LocalRow, MissingLocalPolicy, SyncDomain};
use super::stores::{ListOptions, LocalStore, RemoteStore};
use crate::errors::{Error, Result};

/// Per-record failure captured in a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    pub position: usize,
    pub stable_id: Option<String>,
    pub code: String,
    pub message: String,
}

/// Result of one reconciliation cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub domain: SyncDomain,
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub no_changes: usize,
    pub not_found: usize,
    pub errors: usize,
    pub error_details: Vec<RecordError>,
    pub duration_ms: i64,
}

impl ReconcileSummary {
    fn new(domain: SyncDomain) -> Self {
        Self {
            domain,
            total: 0,
            created: 0,
            updated: 0,
            no_changes: 0,
            not_found: 0,
            errors: 0,
            error_details: Vec::new(),
            duration_ms: 0,
        }
    }

    fn record_error(&mut self, position: usize, stable_id: Option<&str>, err: &Error) {
        self.errors += 1;
        self.error_details.push(RecordError {
            position,
            stable_id: stable_id.map(str::to_string),
            code: err.code().to_string(),
            message: err.to_string(),
        });
    }
}

/// Result of a removal pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupSummary {
    pub domain: SyncDomain,
    pub checked: usize,
    pub deactivated: usize,
    pub errors: usize,
    pub deactivated_ids: Vec<String>,
}

/// How a single record was applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Created { local_id: i64 },
    Updated { changed: FieldMap },
    NoChange,
    NotFound,
}

/// Diffs `remote_fields` against `row` and quietly writes the changed columns.
pub(crate) async fn apply_to_existing(
    local: &dyn LocalStore,
    spec: &DomainSpec,
    row: &LocalRow,
    remote_fields: &FieldMap,
) -> Result<ApplyOutcome> {
    let changes = spec.diff(&row.fields, remote_fields);
    if changes.is_empty() {
        return Ok(ApplyOutcome::NoChange);
    }
    local
        .quiet_update(spec.domain, row, changes.clone())
        .await
        .map_err(|e| Error::record_apply(&row.stable_id, e.to_string()))?;
    Ok(ApplyOutcome::Updated { changed: changes })
}

/// Creates a local row from remote fields. Sync-originated creates are quiet.
pub(crate) async fn create_from_remote(
    local: &dyn LocalStore,
    spec: &DomainSpec,
    stable_id: &str,
    remote_fields: &FieldMap,
) -> Result<LocalRow> {
    let fields = spec.map_remote_fields(remote_fields);
    local
        .create(spec.domain, stable_id, fields)
        .await
        .map_err(|e| Error::record_apply(stable_id, e.to_string()))
}

/// Compares a remote snapshot with local rows and applies idempotent writes
/// to the local store. Never writes to the remote store.
pub struct ReconciliationEngine {
    remote: Arc<dyn RemoteStore>,
    local: Arc<dyn LocalStore>,
}

impl ReconciliationEngine {
    pub fn new(remote: Arc<dyn RemoteStore>, local: Arc<dyn LocalStore>) -> Self {
        Self { remote, local }
    }

    pub fn local_store(&self) -> Arc<dyn LocalStore> {
        Arc::clone(&self.local)
    }

    /// Runs one reconciliation cycle. Failing to read either store aborts the
    /// cycle with an error; failures on individual records are counted and the
    /// scan continues.
    pub async fn reconcile(&self, domain: SyncDomain) -> Result<ReconcileSummary> {
        let started_at = Instant::now();
        let spec = DomainSpec::for_domain(domain);
        let mut summary = ReconcileSummary::new(domain);

        let remote_records = self.remote.list(domain, ListOptions::scan()).await?;
        let mut local_rows: HashMap<String, LocalRow> = self
            .local
            .list(domain)
            .await?
            .into_iter()
            .map(|row| (row.stable_id.clone(), row))
            .collect();

        summary.total = remote_records.len();
        debug!(
            "[Reconcile] {} snapshot: remote={} local={}",
            domain,
            remote_records.len(),
            local_rows.len()
        );

        for (position, record) in remote_records.iter().enumerate() {
            let Some(stable_id) = record.stable_id() else {
                let err = Error::StableIdMissing { position };
                log::warn!("[Reconcile] {} record skipped: {}", domain, err);
                summary.record_error(position, None, &err);
                continue;
            };

            let outcome = match local_rows.get(stable_id) {
                Some(row) => apply_to_existing(self.local.as_ref(), &spec, row, &record.fields).await,
                None => match spec.missing_local {
                    MissingLocalPolicy::Create => {
                        match create_from_remote(self.local.as_ref(), &spec, stable_id, &record.fields)
                            .await
                        {
                            Ok(row) => {
                                let local_id = row.local_id;
                                local_rows.insert(stable_id.to_string(), row);
                                Ok(ApplyOutcome::Created { local_id })
                            }
                            Err(err) => Err(err),
                        }
                    }
                    MissingLocalPolicy::ReportNotFound => Ok(ApplyOutcome::NotFound),
                },
            };

            match outcome {
                Ok(ApplyOutcome::Created { .. }) => summary.created += 1,
                Ok(ApplyOutcome::Updated { changed }) => {
                    debug!(
                        "[Reconcile] {} {} updated columns {:?}",
                        domain,
                        stable_id,
                        changed.keys().collect::<Vec<_>>()
                    );
                    if let Some(row) = local_rows.get_mut(stable_id) {
                        row.fields.extend(changed);
                    }
                    summary.updated += 1;
                }
                Ok(ApplyOutcome::NoChange) => summary.no_changes += 1,
                Ok(ApplyOutcome::NotFound) => summary.not_found += 1,
                Err(err) => {
                    log::error!("[Reconcile] {} {} failed: {}", domain, stable_id, err);
                    summary.record_error(position, Some(stable_id), &err);
                }
            }
        }

        summary.duration_ms = started_at.elapsed().as_millis() as i64;
        info!(
            "[Reconcile] {} done: total={} created={} updated={} no_changes={} not_found={} errors={} ({}ms)",
            domain,
            summary.total,
            summary.created,
            summary.updated,
            summary.no_changes,
            summary.not_found,
            summary.errors,
            summary.duration_ms
        );
        Ok(summary)
    }

    /// Marks local rows inactive when they are absent from a fresh, uncached
    /// remote read. Rows already inactive are left alone.
    pub async fn cleanup(&self, domain: SyncDomain) -> Result<CleanupSummary> {
        let spec = DomainSpec::for_domain(domain);
        let remote_ids: HashSet<String> = self
            .remote
            .list(domain, ListOptions::fresh())
            .await?
            .iter()
            .filter_map(|record| record.stable_id().map(str::to_string))
            .collect();

        let local_rows = self.local.list(domain).await?;
        let mut summary = CleanupSummary {
            domain,
            checked: local_rows.len(),
            deactivated: 0,
            errors: 0,
            deactivated_ids: Vec::new(),
        };

        for row in local_rows {
            if remote_ids.contains(&row.stable_id) || spec.is_inactive(&row.fields) {
                continue;
            }
            match self.local.mark_inactive(domain, &row).await {
                Ok(()) => {
                    summary.deactivated += 1;
                    summary.deactivated_ids.push(row.stable_id);
                }
                Err(err) => {
                    log::error!(
                        "[Reconcile] {} cleanup of {} failed: {}",
                        domain,
                        row.stable_id,
                        err
                    );
                    summary.errors += 1;
                }
            }
        }

        info!(
            "[Reconcile] {} cleanup: checked={} deactivated={} errors={}",
            domain, summary.checked, summary.deactivated, summary.errors
        );
        Ok(summary)
    }
}
