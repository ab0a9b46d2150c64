//! Database model for persisted notification jobs.

use chrono::{DateTime, SecondsFormat, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use attendsync_core::errors::{Error, Result};
use attendsync_core::notifications::{NotificationJob, RecipientRef};

use crate::sync::outbox::{enum_from_db, enum_to_db};

pub(crate) fn time_to_db(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn time_from_db(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::malformed(format!("invalid stored timestamp '{}': {}", value, e)))
}

fn optional_time_from_db(value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    value.map(time_from_db).transpose()
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
#[diesel(table_name = crate::schema::notification_jobs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NotificationJobDB {
    pub id: String,
    pub recipient_kind: String,
    pub recipient_id: String,
    pub title: String,
    pub body: String,
    pub kind: String,
    pub action: Option<String>,
    pub payload: String,
    pub channel_token: Option<String>,
    pub priority: String,
    pub status: String,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: String,
    pub sent_at: Option<String>,
    pub read_at: Option<String>,
    pub scheduled_at: Option<String>,
}

impl TryFrom<&NotificationJob> for NotificationJobDB {
    type Error = Error;

    fn try_from(job: &NotificationJob) -> Result<Self> {
        Ok(Self {
            id: job.id.clone(),
            recipient_kind: job.recipient.kind().to_string(),
            recipient_id: job.recipient.id().to_string(),
            title: job.title.clone(),
            body: job.body.clone(),
            kind: job.kind.clone(),
            action: job.action.clone(),
            payload: serde_json::to_string(&job.payload)?,
            channel_token: job.channel_token.clone(),
            priority: enum_to_db(&job.priority)?,
            status: enum_to_db(&job.status)?,
            message_id: job.message_id.clone(),
            error: job.error.clone(),
            created_at: time_to_db(&job.created_at),
            sent_at: job.sent_at.as_ref().map(time_to_db),
            read_at: job.read_at.as_ref().map(time_to_db),
            scheduled_at: job.scheduled_at.as_ref().map(time_to_db),
        })
    }
}

impl TryFrom<NotificationJobDB> for NotificationJob {
    type Error = Error;

    fn try_from(row: NotificationJobDB) -> Result<Self> {
        let recipient = RecipientRef::parse(&format!("{}:{}", row.recipient_kind, row.recipient_id))?;
        Ok(Self {
            id: row.id,
            recipient,
            title: row.title,
            body: row.body,
            kind: row.kind,
            action: row.action,
            payload: serde_json::from_str(&row.payload)?,
            channel_token: row.channel_token,
            priority: enum_from_db(&row.priority)?,
            status: enum_from_db(&row.status)?,
            message_id: row.message_id,
            error: row.error,
            created_at: time_from_db(&row.created_at)?,
            sent_at: optional_time_from_db(row.sent_at.as_deref())?,
            read_at: optional_time_from_db(row.read_at.as_deref())?,
            scheduled_at: optional_time_from_db(row.scheduled_at.as_deref())?,
        })
    }
}
