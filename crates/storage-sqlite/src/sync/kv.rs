//! Shared key-value store with expiry over the `kv_store` table.
//!
//! Separate server processes pointed at the same database file observe the
//! same scheduler leases and dedup entries.

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sqlite::SqliteConnection;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use attendsync_core::cache::KeyValueStore;
use attendsync_core::errors::Result;

use super::outbox::now_text;
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;
use crate::schema::kv_store;

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
#[diesel(primary_key(key))]
#[diesel(table_name = crate::schema::kv_store)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct KvEntryDB {
    pub key: String,
    pub value: String,
    /// Unix epoch milliseconds.
    pub expires_at: Option<i64>,
    pub updated_at: String,
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn expiry_from(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_millis().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

fn upsert_entry(conn: &mut SqliteConnection, row: &KvEntryDB) -> Result<()> {
    diesel::insert_into(kv_store::table)
        .values(row)
        .on_conflict(kv_store::key)
        .do_update()
        .set((
            kv_store::value.eq(row.value.as_str()),
            kv_store::expires_at.eq(row.expires_at),
            kv_store::updated_at.eq(row.updated_at.as_str()),
        ))
        .execute(conn)
        .map_err(StorageError::from)?;
    Ok(())
}

pub struct SqliteKeyValueStore {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl SqliteKeyValueStore {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }

    /// Deletes expired entries and returns how many were removed.
    pub async fn purge_expired(&self) -> Result<usize> {
        self.writer
            .exec(move |conn| {
                let removed = diesel::delete(
                    kv_store::table.filter(kv_store::expires_at.le(now_millis())),
                )
                .execute(conn)
                .map_err(StorageError::from)?;
                Ok(removed)
            })
            .await
    }
}

#[async_trait]
impl KeyValueStore for SqliteKeyValueStore {
    async fn get(&self, key_value: &str) -> Result<Option<String>> {
        let mut conn = get_connection(&self.pool)?;
        let value = kv_store::table
            .filter(kv_store::key.eq(key_value))
            .filter(
                kv_store::expires_at
                    .is_null()
                    .or(kv_store::expires_at.gt(now_millis())),
            )
            .select(kv_store::value)
            .first::<String>(&mut conn)
            .optional()
            .map_err(StorageError::from)?;
        Ok(value)
    }

    async fn set(&self, key_value: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let row = KvEntryDB {
            key: key_value.to_string(),
            value: value.to_string(),
            expires_at: expiry_from(ttl),
            updated_at: now_text(),
        };
        self.writer.exec(move |conn| upsert_entry(conn, &row)).await
    }

    async fn set_if_absent(
        &self,
        key_value: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let row = KvEntryDB {
            key: key_value.to_string(),
            value: value.to_string(),
            expires_at: expiry_from(ttl),
            updated_at: now_text(),
        };
        // The read and the write share one immediate transaction.
        self.writer
            .exec(move |conn| {
                let existing = kv_store::table
                    .find(row.key.as_str())
                    .first::<KvEntryDB>(conn)
                    .optional()
                    .map_err(StorageError::from)?;
                let live = existing
                    .map(|entry| entry.expires_at.map(|at| at > now_millis()).unwrap_or(true))
                    .unwrap_or(false);
                if live {
                    return Ok(false);
                }
                upsert_entry(conn, &row)?;
                Ok(true)
            })
            .await
    }

    async fn remove(&self, key_value: &str) -> Result<()> {
        let key_value = key_value.to_string();
        self.writer
            .exec(move |conn| {
                diesel::delete(kv_store::table.find(key_value))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(())
            })
            .await
    }

    async fn remove_many(&self, keys: &[String]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys = keys.to_vec();
        self.writer
            .exec(move |conn| {
                let removed = diesel::delete(kv_store::table.filter(kv_store::key.eq_any(keys)))
                    .execute(conn)
                    .map_err(StorageError::from)?;
                Ok(removed)
            })
            .await
    }
}
