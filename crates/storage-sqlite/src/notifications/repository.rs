use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;
use std::sync::Arc;

use attendsync_core::errors::Result;
use attendsync_core::notifications::{
    Delivery, JobStatus, NotificationJob, NotificationRepository, RecipientDirectory,
    RecipientRef,
};
use attendsync_core::sync::{DomainSpec, SyncDomain};

use super::model::{time_to_db, NotificationJobDB};
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::{employees, notification_jobs};
use crate::sync::outbox::enum_to_db;

pub struct SqliteNotificationRepository {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl SqliteNotificationRepository {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }
}

fn to_jobs(rows: Vec<NotificationJobDB>) -> Result<Vec<NotificationJob>> {
    rows.into_iter().map(NotificationJob::try_from).collect()
}

#[async_trait]
impl NotificationRepository for SqliteNotificationRepository {
    async fn insert(&self, job: &NotificationJob) -> Result<()> {
        let row = NotificationJobDB::try_from(job)?;
        self.writer
            .exec(move |conn| {
                diesel::insert_into(notification_jobs::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationJob>> {
        let mut conn = get_connection(&self.pool)?;
        notification_jobs::table
            .find(id)
            .first::<NotificationJobDB>(&mut conn)
            .optional()
            .map_err(StorageError::from)?
            .map(NotificationJob::try_from)
            .transpose()
    }

    async fn record_delivery(&self, id: &str, delivery: &Delivery) -> Result<()> {
        let id = id.to_string();
        let status = enum_to_db(&delivery.status)?;
        let channel_token = delivery.channel_token.clone();
        let sent_at = delivery.sent_at.as_ref().map(time_to_db);
        let message_id = delivery.message_id.clone();
        let error = delivery.error.clone();
        self.writer
            .exec(move |conn| {
                let affected = diesel::update(notification_jobs::table.find(id.as_str()))
                    .set((
                        notification_jobs::status.eq(status),
                        notification_jobs::channel_token.eq(channel_token),
                        notification_jobs::sent_at.eq(sent_at),
                        notification_jobs::message_id.eq(message_id),
                        notification_jobs::error.eq(error),
                    ))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                if affected == 0 {
                    return Err(StorageError::from(diesel::result::Error::NotFound).into());
                }
                Ok(())
            })
            .await
    }

    async fn mark_read(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let id = id.to_string();
        let read_at = time_to_db(&at);
        self.writer
            .exec(move |conn| {
                let exists = notification_jobs::table
                    .find(id.as_str())
                    .select(notification_jobs::id)
                    .first::<String>(conn)
                    .optional()
                    .map_err(StorageError::from)?
                    .is_some();
                if !exists {
                    return Ok(false);
                }
                // The first read wins.
                diesel::update(
                    notification_jobs::table
                        .find(id.as_str())
                        .filter(notification_jobs::read_at.is_null()),
                )
                .set(notification_jobs::read_at.eq(Some(read_at)))
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(true)
            })
            .await
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>> {
        let now = time_to_db(&now);
        let scheduled = enum_to_db(&JobStatus::Scheduled)?;
        let pending = enum_to_db(&JobStatus::Pending)?;
        // Select and flip in one write transaction so concurrent sweeps never
        // claim the same job.
        self.writer
            .exec(move |conn| {
                let rows = notification_jobs::table
                    .filter(notification_jobs::status.eq(scheduled.as_str()))
                    .filter(notification_jobs::scheduled_at.le(now.as_str()))
                    .order(notification_jobs::scheduled_at.asc())
                    .load::<NotificationJobDB>(conn)
                    .map_err(StorageError::from)?;
                if rows.is_empty() {
                    return Ok(Vec::new());
                }
                let ids = rows.iter().map(|r| r.id.clone()).collect::<Vec<_>>();
                diesel::update(notification_jobs::table.filter(notification_jobs::id.eq_any(&ids)))
                    .set(notification_jobs::status.eq(pending.as_str()))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                let claimed = rows
                    .into_iter()
                    .map(|mut row| {
                        row.status = pending.clone();
                        row
                    })
                    .collect();
                to_jobs(claimed)
            })
            .await
    }

    async fn recent_similar(
        &self,
        recipient: &RecipientRef,
        title_value: &str,
        kind_value: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<NotificationJob>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = notification_jobs::table
            .filter(notification_jobs::recipient_kind.eq(recipient.kind()))
            .filter(notification_jobs::recipient_id.eq(recipient.id()))
            .filter(notification_jobs::title.eq(title_value))
            .filter(notification_jobs::kind.eq(kind_value))
            .filter(notification_jobs::created_at.ge(time_to_db(&since)))
            .order(notification_jobs::created_at.desc())
            .load::<NotificationJobDB>(&mut conn)
            .map_err(StorageError::from)?;
        to_jobs(rows)
    }

    async fn list_for_recipient(&self, recipient: &RecipientRef) -> Result<Vec<NotificationJob>> {
        let mut conn = get_connection(&self.pool)?;
        let rows = notification_jobs::table
            .filter(notification_jobs::recipient_kind.eq(recipient.kind()))
            .filter(notification_jobs::recipient_id.eq(recipient.id()))
            .order(notification_jobs::created_at.desc())
            .load::<NotificationJobDB>(&mut conn)
            .map_err(StorageError::from)?;
        to_jobs(rows)
    }
}

/// Broadcast audience: every employee not in the inactive status.
pub struct SqliteRecipientDirectory {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
}

impl SqliteRecipientDirectory {
    pub fn new(pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecipientDirectory for SqliteRecipientDirectory {
    async fn all_recipients(&self) -> Result<Vec<RecipientRef>> {
        let inactive = DomainSpec::for_domain(SyncDomain::Employee).inactive_status;
        let mut conn = get_connection(&self.pool)?;
        let ids = employees::table
            .filter(
                employees::status
                    .is_null()
                    .or(employees::status.ne(inactive)),
            )
            .order(employees::id.asc())
            .select(employees::stable_id)
            .load::<String>(&mut conn)
            .map_err(StorageError::from)?;
        Ok(ids.into_iter().map(RecipientRef::Employee).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, init, run_migrations, spawn_writer};
    use crate::sync::{SqliteKeyValueStore, SqliteLocalStore};
    use attendsync_core::notifications::{
        DispatchConfig, DispatchOptions, DispatchStatus, DispatchStores, DuplicateSuppressor,
        InMemoryTokenStore, NotificationContent, NotificationDispatchEngine,
        RecordingPushTransport,
    };
    use attendsync_core::sync::{FieldMap, LocalStore};
    use chrono::Duration;
    use tempfile::tempdir;

    type DbPool = Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>;

    fn setup_db() -> (DbPool, WriteHandle) {
        let app_data = tempdir().unwrap().keep().to_string_lossy().to_string();
        let db_path = init(&app_data).unwrap();
        run_migrations(&db_path).unwrap();
        let pool = create_pool(&db_path).unwrap();
        let writer = spawn_writer(pool.as_ref().clone());
        (pool, writer)
    }

    fn employee(id: &str) -> RecipientRef {
        RecipientRef::Employee(id.to_string())
    }

    fn content(title: &str) -> NotificationContent {
        NotificationContent {
            title: title.to_string(),
            body: "body".to_string(),
            payload: [("date".to_string(), "2026-03-04".to_string())]
                .into_iter()
                .collect(),
            options: DispatchOptions::kind("attendance_reminder").with_action("open_presence"),
        }
    }

    #[tokio::test]
    async fn insert_get_and_record_delivery() {
        let (pool, writer) = setup_db();
        let repo = SqliteNotificationRepository::new(pool, writer);
        let job = NotificationJob::new(employee("E1"), &content("Hi"), JobStatus::Pending, None);
        repo.insert(&job).await.unwrap();

        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.recipient, employee("E1"));
        assert_eq!(stored.payload, job.payload);
        assert_eq!(stored.action.as_deref(), Some("open_presence"));

        repo.record_delivery(&job.id, &Delivery::sent("tok-1", Some("m-1".to_string())))
            .await
            .unwrap();
        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Sent);
        assert_eq!(stored.channel_token.as_deref(), Some("tok-1"));
        assert_eq!(stored.message_id.as_deref(), Some("m-1"));
        assert!(stored.sent_at.is_some());

        assert!(repo
            .record_delivery("missing", &Delivery::failed("t", "x"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn mark_read_keeps_first_timestamp_and_status() {
        let (pool, writer) = setup_db();
        let repo = SqliteNotificationRepository::new(pool, writer);
        let job = NotificationJob::new(employee("E1"), &content("Hi"), JobStatus::Sent, None);
        repo.insert(&job).await.unwrap();

        let first = Utc::now();
        assert!(repo.mark_read(&job.id, first).await.unwrap());
        assert!(repo
            .mark_read(&job.id, first + Duration::minutes(5))
            .await
            .unwrap());
        assert!(!repo.mark_read("missing", first).await.unwrap());

        let stored = repo.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Sent);
        assert_eq!(
            stored.read_at.map(|at| at.timestamp_micros()),
            Some(first.timestamp_micros())
        );
    }

    #[tokio::test]
    async fn claim_due_returns_each_job_once() {
        let (pool, writer) = setup_db();
        let repo = SqliteNotificationRepository::new(pool, writer);
        let now = Utc::now();

        let mut due = NotificationJob::new(employee("E1"), &content("Due"), JobStatus::Scheduled, None);
        due.scheduled_at = Some(now - Duration::minutes(1));
        let mut later = NotificationJob::new(employee("E1"), &content("Later"), JobStatus::Scheduled, None);
        later.scheduled_at = Some(now + Duration::hours(1));
        repo.insert(&due).await.unwrap();
        repo.insert(&later).await.unwrap();

        let claimed = repo.claim_due(now).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, due.id);
        assert_eq!(claimed[0].status, JobStatus::Pending);
        assert!(repo.claim_due(now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn recent_similar_filters_by_recipient_title_kind_and_window() {
        let (pool, writer) = setup_db();
        let repo = SqliteNotificationRepository::new(pool, writer);
        let mut old = NotificationJob::new(employee("E1"), &content("Hi"), JobStatus::Sent, None);
        old.created_at = Utc::now() - Duration::hours(1);
        repo.insert(&old).await.unwrap();
        repo.insert(&NotificationJob::new(employee("E1"), &content("Hi"), JobStatus::Sent, None))
            .await
            .unwrap();
        repo.insert(&NotificationJob::new(employee("E2"), &content("Hi"), JobStatus::Sent, None))
            .await
            .unwrap();
        repo.insert(&NotificationJob::new(employee("E1"), &content("Other"), JobStatus::Sent, None))
            .await
            .unwrap();

        let recent = repo
            .recent_similar(
                &employee("E1"),
                "Hi",
                "attendance_reminder",
                Utc::now() - Duration::minutes(15),
            )
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(repo.list_for_recipient(&employee("E1")).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn directory_lists_only_active_employees() {
        let (pool, writer) = setup_db();
        let local = SqliteLocalStore::new(pool.clone(), writer.clone());
        let mut inactive = FieldMap::new();
        inactive.insert("status".to_string(), "non-aktif".into());
        local.create(SyncDomain::Employee, "E1", FieldMap::new()).await.unwrap();
        local.create(SyncDomain::Employee, "E2", inactive).await.unwrap();
        local.create(SyncDomain::Employee, "E3", FieldMap::new()).await.unwrap();

        let directory = SqliteRecipientDirectory::new(pool);
        assert_eq!(
            directory.all_recipients().await.unwrap(),
            vec![employee("E1"), employee("E3")]
        );
    }

    #[tokio::test]
    async fn dispatch_engine_dedups_across_restart_using_persisted_history() {
        let (pool, writer) = setup_db();
        let tokens = Arc::new(InMemoryTokenStore::new());
        let jobs: Arc<dyn NotificationRepository> =
            Arc::new(SqliteNotificationRepository::new(pool.clone(), writer.clone()));
        let engine = |kv: Arc<SqliteKeyValueStore>| {
            let stores = DispatchStores {
                tokens: tokens.clone(),
                jobs: jobs.clone(),
                transport: Arc::new(RecordingPushTransport::new()),
                directory: Arc::new(SqliteRecipientDirectory::new(pool.clone())),
            };
            NotificationDispatchEngine::new(stores, DispatchConfig::default()).with_suppressor(
                DuplicateSuppressor::new(
                    kv,
                    jobs.clone(),
                    Default::default(),
                ),
            )
        };

        let first = engine(Arc::new(SqliteKeyValueStore::new(pool.clone(), writer.clone())));
        first
            .dispatch_to_recipient(&employee("E1"), &content("Reminder"))
            .await
            .unwrap();

        // Wipe the dedup cache to simulate a lost cache tier.
        let kv = Arc::new(SqliteKeyValueStore::new(pool.clone(), writer.clone()));
        diesel::delete(crate::schema::kv_store::table)
            .execute(&mut get_connection(&pool).unwrap())
            .unwrap();
        let second = engine(kv);
        let outcome = second
            .dispatch_to_recipient(&employee("E1"), &content("Reminder"))
            .await
            .unwrap();
        assert_eq!(outcome.status, DispatchStatus::Suppressed);
    }
}
