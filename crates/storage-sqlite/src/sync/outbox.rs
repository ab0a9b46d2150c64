//! Write-back queue. Rows are only written by non-quiet local writes.

use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, warn};
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use attendsync_core::errors::Result;
use attendsync_core::sync::{FieldMap, RemoteStore, SyncDomain};

use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::sync_outbox;

pub(crate) fn enum_to_db<T: Serialize>(value: &T) -> Result<String> {
    Ok(serde_json::to_string(value)?.trim_matches('"').to_string())
}

pub(crate) fn enum_from_db<T: serde::de::DeserializeOwned>(value: &str) -> Result<T> {
    Ok(serde_json::from_str(&format!("\"{}\"", value))?)
}

pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOp {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
}

#[derive(
    Queryable,
    Identifiable,
    Insertable,
    AsChangeset,
    Selectable,
    Debug,
    Clone,
    Serialize,
    Deserialize,
)]
#[diesel(primary_key(event_id))]
#[diesel(table_name = crate::schema::sync_outbox)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SyncOutboxEventDB {
    pub event_id: String,
    pub domain: String,
    pub stable_id: String,
    pub op: String,
    pub payload: String,
    pub status: String,
    pub created_at: String,
    pub sent_at: Option<String>,
}

/// A queued write-back to the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: String,
    pub domain: SyncDomain,
    pub stable_id: String,
    pub op: OutboxOp,
    /// Changed fields under remote field names.
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub created_at: String,
}

impl TryFrom<SyncOutboxEventDB> for OutboxEvent {
    type Error = attendsync_core::Error;

    fn try_from(row: SyncOutboxEventDB) -> Result<Self> {
        Ok(Self {
            event_id: row.event_id,
            domain: enum_from_db(&row.domain)?,
            stable_id: row.stable_id,
            op: enum_from_db(&row.op)?,
            payload: serde_json::from_str(&row.payload)?,
            status: enum_from_db(&row.status)?,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone)]
pub struct OutboxWriteRequest {
    pub event_id: Option<String>,
    pub domain: SyncDomain,
    pub stable_id: String,
    pub op: OutboxOp,
    pub payload: serde_json::Value,
}

impl OutboxWriteRequest {
    pub fn new(
        domain: SyncDomain,
        stable_id: impl Into<String>,
        op: OutboxOp,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: None,
            domain,
            stable_id: stable_id.into(),
            op,
            payload,
        }
    }
}

/// Inserts an outbox row on the caller's connection, so it commits or rolls
/// back together with the data write.
pub fn write_outbox_event(
    conn: &mut SqliteConnection,
    request: OutboxWriteRequest,
) -> Result<String> {
    let event_id = request
        .event_id
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    let row = SyncOutboxEventDB {
        event_id: event_id.clone(),
        domain: enum_to_db(&request.domain)?,
        stable_id: request.stable_id,
        op: enum_to_db(&request.op)?,
        payload: serde_json::to_string(&request.payload)?,
        status: enum_to_db(&OutboxStatus::Pending)?,
        created_at: now_text(),
        sent_at: None,
    };

    diesel::insert_into(sync_outbox::table)
        .values(&row)
        .execute(conn)
        .map_err(StorageError::from)?;

    Ok(event_id)
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelaySummary {
    pub sent: usize,
    /// Events left pending after a remote failure.
    pub remaining: usize,
}

pub struct OutboxRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl OutboxRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }

    /// Oldest pending events first.
    pub fn list_pending(&self, limit_value: i64) -> Result<Vec<OutboxEvent>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = sync_outbox::table
            .filter(sync_outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?))
            .order(sync_outbox::created_at.asc())
            .limit(limit_value)
            .load::<SyncOutboxEventDB>(&mut conn)
            .map_err(StorageError::from)?;
        rows.into_iter().map(OutboxEvent::try_from).collect()
    }

    pub fn count_pending(&self) -> Result<i64> {
        let mut conn = get_connection(&self.pool)?;
        let count = sync_outbox::table
            .filter(sync_outbox::status.eq(enum_to_db(&OutboxStatus::Pending)?))
            .count()
            .get_result::<i64>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(count)
    }

    pub async fn mark_sent(&self, event_ids: Vec<String>) -> Result<()> {
        if event_ids.is_empty() {
            return Ok(());
        }

        self.writer
            .exec(move |conn| {
                diesel::update(sync_outbox::table.filter(sync_outbox::event_id.eq_any(event_ids)))
                    .set((
                        sync_outbox::status.eq(enum_to_db(&OutboxStatus::Sent)?),
                        sync_outbox::sent_at.eq(Some(now_text())),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    /// Pushes up to `limit` pending events to `remote`, oldest first. The pass
    /// stops at the first failure so later events for a record never overtake
    /// an earlier one.
    pub async fn relay(&self, remote: &dyn RemoteStore, limit: i64) -> Result<RelaySummary> {
        let pending = self.list_pending(limit)?;
        let mut delivered = Vec::with_capacity(pending.len());
        for event in &pending {
            let fields: FieldMap = event.payload.as_object().cloned().unwrap_or_default();
            let pushed = match event.op {
                OutboxOp::Create => remote.create(event.domain, &event.stable_id, &fields).await,
                OutboxOp::Update => remote.update(event.domain, &event.stable_id, &fields).await,
                OutboxOp::Delete => remote.delete(event.domain, &event.stable_id).await,
            };
            if let Err(err) = pushed {
                warn!(
                    "[Outbox] {:?} {} {} failed, will retry: {}",
                    event.op, event.domain, event.stable_id, err
                );
                break;
            }
            delivered.push(event.event_id.clone());
        }

        let summary = RelaySummary {
            sent: delivered.len(),
            remaining: pending.len() - delivered.len(),
        };
        self.mark_sent(delivered).await?;
        if summary.sent > 0 {
            debug!("[Outbox] relayed {} events", summary.sent);
        }
        Ok(summary)
    }

    /// Deletes sent events whose `sent_at` is before `cutoff`.
    pub async fn prune_sent(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);
        self.writer
            .exec(move |conn| {
                let removed = diesel::delete(
                    sync_outbox::table
                        .filter(sync_outbox::status.eq(enum_to_db(&OutboxStatus::Sent)?))
                        .filter(sync_outbox::sent_at.lt(cutoff)),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(removed)
            })
            .await
    }
}
