//! SQLite-backed `LocalStore` for the employee, permit and presence tables.
//!
//! Column sets come from each domain's mapping table, so reads and writes go
//! through dynamic SQL. Every write validates column names against the live
//! table definition before touching the database.

use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{self, Pool};
use diesel::sql_types::{BigInt, Text};
use diesel::sqlite::SqliteConnection;
use log::debug;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock};

use attendsync_core::errors::{DatabaseError, Error, Result};
use attendsync_core::sync::{DomainSpec, FieldMap, LocalRow, LocalStore, SyncDomain};

use super::outbox::{now_text, write_outbox_event, OutboxOp, OutboxWriteRequest};
use crate::db::{get_connection, WriteHandle};
use crate::errors::StorageError;

/// Columns managed by the store itself and never written from a field map.
const RESERVED_COLUMNS: &[&str] = &["id", "stable_id", "created_at", "updated_at"];

fn table_columns_cache() -> &'static Mutex<HashMap<String, HashSet<String>>> {
    static CACHE: OnceLock<Mutex<HashMap<String, HashSet<String>>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

fn escape_sqlite_str(value: &str) -> String {
    value.replace('\'', "''")
}

fn quote_identifier(value: &str) -> String {
    format!("`{}`", value.replace('`', "``"))
}

fn json_value_to_sql_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(v) => {
            if *v {
                "1".to_string()
            } else {
                "0".to_string()
            }
        }
        Value::Number(v) => v.to_string(),
        Value::String(v) => format!("'{}'", escape_sqlite_str(v)),
        Value::Array(_) | Value::Object(_) => format!(
            "'{}'",
            escape_sqlite_str(&serde_json::to_string(value).unwrap_or_default())
        ),
    }
}

#[derive(QueryableByName)]
struct PragmaTableInfoRow {
    #[diesel(sql_type = Text)]
    name: String,
}

#[derive(QueryableByName)]
struct LocalRowRecord {
    #[diesel(sql_type = BigInt)]
    id: i64,
    #[diesel(sql_type = Text)]
    stable_id: String,
    #[diesel(sql_type = Text)]
    fields: String,
}

impl TryFrom<LocalRowRecord> for LocalRow {
    type Error = Error;

    fn try_from(record: LocalRowRecord) -> Result<Self> {
        Ok(LocalRow {
            local_id: record.id,
            stable_id: record.stable_id,
            fields: serde_json::from_str(&record.fields)?,
        })
    }
}

fn load_table_columns(conn: &mut SqliteConnection, table_name: &str) -> Result<HashSet<String>> {
    let sql = format!("PRAGMA main.table_info('{}')", escape_sqlite_str(table_name));
    let columns = diesel::sql_query(sql)
        .load::<PragmaTableInfoRow>(conn)
        .map_err(StorageError::from)?
        .into_iter()
        .map(|row| row.name)
        .collect();
    Ok(columns)
}

fn validate_columns(conn: &mut SqliteConnection, table_name: &str, fields: &FieldMap) -> Result<()> {
    let poisoned = || {
        Error::Database(DatabaseError::Internal(
            "Table column cache is poisoned".to_string(),
        ))
    };
    let cached = table_columns_cache()
        .lock()
        .map_err(|_| poisoned())?
        .get(table_name)
        .cloned();
    let known_columns = match cached {
        Some(columns) => columns,
        None => {
            let columns = load_table_columns(conn, table_name)?;
            table_columns_cache()
                .lock()
                .map_err(|_| poisoned())?
                .insert(table_name.to_string(), columns.clone());
            columns
        }
    };

    for column in fields.keys() {
        if RESERVED_COLUMNS.contains(&column.as_str()) || !known_columns.contains(column) {
            return Err(Error::Database(DatabaseError::Internal(format!(
                "Column '{}' is not writable on table '{}'",
                column, table_name
            ))));
        }
    }
    Ok(())
}

/// Local columns read for a domain: every mapped column plus the status column.
fn local_columns(spec: &DomainSpec) -> Vec<&'static str> {
    let mut columns: Vec<&'static str> = Vec::new();
    for mapping in spec.mappings {
        if !columns.contains(&mapping.local_key) {
            columns.push(mapping.local_key);
        }
    }
    if !columns.contains(&spec.status_column) {
        columns.push(spec.status_column);
    }
    columns
}

fn select_sql(spec: &DomainSpec, filter: &str) -> String {
    let pairs = local_columns(spec)
        .into_iter()
        .map(|column| format!("'{}', {}", escape_sqlite_str(column), quote_identifier(column)))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT id, stable_id, json_object({}) AS fields FROM {} {} ORDER BY id",
        pairs,
        quote_identifier(spec.domain.table_name()),
        filter
    )
}

fn find_row(conn: &mut SqliteConnection, spec: &DomainSpec, filter: &str) -> Result<Option<LocalRow>> {
    diesel::sql_query(select_sql(spec, filter))
        .get_result::<LocalRowRecord>(conn)
        .optional()
        .map_err(StorageError::from)?
        .map(LocalRow::try_from)
        .transpose()
}

fn stable_id_filter(stable_id: &str) -> String {
    format!("WHERE stable_id = '{}'", escape_sqlite_str(stable_id))
}

fn insert_row(
    conn: &mut SqliteConnection,
    spec: &DomainSpec,
    stable_id: &str,
    fields: &FieldMap,
) -> Result<LocalRow> {
    let table = spec.domain.table_name();
    validate_columns(conn, table, fields)?;

    let now = now_text();
    let mut columns = vec![quote_identifier("stable_id")];
    let mut values = vec![json_value_to_sql_literal(&Value::String(stable_id.to_string()))];
    // Supplied nulls are written as NULL; defaults cover only absent columns.
    for (column, value) in fields.iter() {
        columns.push(quote_identifier(column));
        values.push(json_value_to_sql_literal(value));
    }
    columns.push(quote_identifier("created_at"));
    values.push(format!("'{}'", now));
    columns.push(quote_identifier("updated_at"));
    values.push(format!("'{}'", now));

    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_identifier(table),
        columns.join(", "),
        values.join(", ")
    );
    diesel::sql_query(sql)
        .execute(conn)
        .map_err(StorageError::from)?;

    find_row(conn, spec, &stable_id_filter(stable_id))?.ok_or_else(|| {
        Error::Database(DatabaseError::NotFound(format!(
            "{} '{}' after insert",
            spec.domain, stable_id
        )))
    })
}

fn update_row(
    conn: &mut SqliteConnection,
    spec: &DomainSpec,
    local_id: i64,
    fields: &FieldMap,
) -> Result<usize> {
    let table = spec.domain.table_name();
    validate_columns(conn, table, fields)?;

    let mut assignments = fields
        .iter()
        .map(|(column, value)| {
            format!(
                "{} = {}",
                quote_identifier(column),
                json_value_to_sql_literal(value)
            )
        })
        .collect::<Vec<_>>();
    assignments.push(format!("{} = '{}'", quote_identifier("updated_at"), now_text()));

    let sql = format!(
        "UPDATE {} SET {} WHERE id = {}",
        quote_identifier(table),
        assignments.join(", "),
        local_id
    );
    let affected = diesel::sql_query(sql)
        .execute(conn)
        .map_err(StorageError::from)?;
    if affected == 0 {
        return Err(Error::Database(DatabaseError::NotFound(format!(
            "{} row {}",
            spec.domain, local_id
        ))));
    }
    Ok(affected)
}

/// `LocalStore` over the domain tables. `update` and `delete` enqueue a
/// write-back event in the same transaction; the reconciliation paths
/// (`create`, `quiet_update`, `mark_inactive`) never do.
pub struct SqliteLocalStore {
    pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
    writer: WriteHandle,
}

impl SqliteLocalStore {
    pub fn new(
        pool: Arc<Pool<r2d2::ConnectionManager<SqliteConnection>>>,
        writer: WriteHandle,
    ) -> Self {
        Self { pool, writer }
    }

    async fn write_fields(
        &self,
        domain: SyncDomain,
        row: &LocalRow,
        fields: FieldMap,
        write_back: bool,
    ) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let spec = DomainSpec::for_domain(domain);
        let local_id = row.local_id;
        let stable_id = row.stable_id.clone();
        self.writer
            .exec(move |conn| {
                update_row(conn, &spec, local_id, &fields)?;
                if write_back {
                    let payload = Value::Object(spec.map_local_fields(&fields));
                    write_outbox_event(
                        conn,
                        OutboxWriteRequest::new(domain, stable_id, OutboxOp::Update, payload),
                    )?;
                }
                Ok(())
            })
            .await
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    async fn find_by_stable_id(
        &self,
        domain: SyncDomain,
        stable_id: &str,
    ) -> Result<Option<LocalRow>> {
        let mut conn = get_connection(&self.pool)?;
        let spec = DomainSpec::for_domain(domain);
        find_row(&mut conn, &spec, &stable_id_filter(stable_id))
    }

    async fn list(&self, domain: SyncDomain) -> Result<Vec<LocalRow>> {
        let mut conn = get_connection(&self.pool)?;
        let spec = DomainSpec::for_domain(domain);
        diesel::sql_query(select_sql(&spec, ""))
            .load::<LocalRowRecord>(&mut conn)
            .map_err(StorageError::from)?
            .into_iter()
            .map(LocalRow::try_from)
            .collect()
    }

    async fn create(
        &self,
        domain: SyncDomain,
        stable_id: &str,
        fields: FieldMap,
    ) -> Result<LocalRow> {
        let spec = DomainSpec::for_domain(domain);
        let stable_id = stable_id.to_string();
        let row = self
            .writer
            .exec(move |conn| insert_row(conn, &spec, &stable_id, &fields))
            .await?;
        debug!("[LocalStore] created {} '{}' as {}", domain, row.stable_id, row.local_id);
        Ok(row)
    }

    async fn quiet_update(
        &self,
        domain: SyncDomain,
        row: &LocalRow,
        fields: FieldMap,
    ) -> Result<()> {
        self.write_fields(domain, row, fields, false).await
    }

    async fn update(&self, domain: SyncDomain, row: &LocalRow, fields: FieldMap) -> Result<()> {
        self.write_fields(domain, row, fields, true).await
    }

    async fn mark_inactive(&self, domain: SyncDomain, row: &LocalRow) -> Result<()> {
        let spec = DomainSpec::for_domain(domain);
        let mut fields = FieldMap::new();
        fields.insert(
            spec.status_column.to_string(),
            Value::String(spec.inactive_status.to_string()),
        );
        self.write_fields(domain, row, fields, false).await
    }

    async fn delete(&self, domain: SyncDomain, row: &LocalRow) -> Result<()> {
        let table = domain.table_name();
        let local_id = row.local_id;
        let stable_id = row.stable_id.clone();
        self.writer
            .exec(move |conn| {
                let sql = format!("DELETE FROM {} WHERE id = {}", quote_identifier(table), local_id);
                diesel::sql_query(sql)
                    .execute(conn)
                    .map_err(StorageError::from)?;
                write_outbox_event(
                    conn,
                    OutboxWriteRequest::new(
                        domain,
                        stable_id,
                        OutboxOp::Delete,
                        Value::Object(FieldMap::new()),
                    ),
                )?;
                Ok(())
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{create_pool, init, run_migrations, spawn_writer};
    use crate::sync::outbox::OutboxRepository;
    use crate::sync::outbox::RelaySummary;
    use attendsync_core::sync::{InMemoryRemoteStore, ReconciliationEngine, RemoteRecord, RemoteStore};
    use serde_json::json;
    use tempfile::tempdir;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    fn setup_db() -> (SqliteLocalStore, OutboxRepository) {
        let app_data = tempdir().unwrap().keep().to_string_lossy().to_string();
        let db_path = init(&app_data).unwrap();
        run_migrations(&db_path).unwrap();
        let pool = create_pool(&db_path).unwrap();
        let writer = spawn_writer(pool.as_ref().clone());
        (
            SqliteLocalStore::new(pool.clone(), writer.clone()),
            OutboxRepository::new(pool, writer),
        )
    }

    #[tokio::test]
    async fn create_applies_column_defaults_and_reads_back_mapped_fields() {
        let (store, outbox) = setup_db();
        let row = store
            .create(
                SyncDomain::Employee,
                "E1",
                fields(json!({ "name": "Alice", "email": "alice@example.com", "phone": null })),
            )
            .await
            .unwrap();

        assert_eq!(row.stable_id, "E1");
        assert_eq!(row.fields.get("name"), Some(&json!("Alice")));
        assert_eq!(row.fields.get("status"), Some(&json!("aktif")));
        assert_eq!(row.fields.get("phone"), Some(&Value::Null));

        let found = store
            .find_by_stable_id(SyncDomain::Employee, "E1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found, row);
        assert_eq!(outbox.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn duplicate_stable_id_is_rejected() {
        let (store, _) = setup_db();
        store
            .create(SyncDomain::Employee, "E1", FieldMap::new())
            .await
            .unwrap();
        let err = store
            .create(SyncDomain::Employee, "E1", FieldMap::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "database_error");
        assert_eq!(store.list(SyncDomain::Employee).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn only_regular_updates_enqueue_write_back() {
        let (store, outbox) = setup_db();
        let row = store
            .create(SyncDomain::Employee, "E1", fields(json!({ "phone": "0811" })))
            .await
            .unwrap();

        store
            .quiet_update(SyncDomain::Employee, &row, fields(json!({ "phone": "0812" })))
            .await
            .unwrap();
        store.mark_inactive(SyncDomain::Employee, &row).await.unwrap();
        assert_eq!(outbox.count_pending().unwrap(), 0);

        store
            .update(SyncDomain::Employee, &row, fields(json!({ "phone": "0813" })))
            .await
            .unwrap();
        let pending = outbox.list_pending(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].stable_id, "E1");
        assert_eq!(pending[0].op, OutboxOp::Update);
        // Payload uses remote field names.
        assert_eq!(pending[0].payload, json!({ "phone_number": "0813" }));

        outbox.mark_sent(vec![pending[0].event_id.clone()]).await.unwrap();
        assert_eq!(outbox.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn mark_inactive_sets_domain_status() {
        let (store, _) = setup_db();
        let row = store
            .create(SyncDomain::Permit, "P1", fields(json!({ "status": "approved" })))
            .await
            .unwrap();
        store.mark_inactive(SyncDomain::Permit, &row).await.unwrap();
        let row = store
            .find_by_stable_id(SyncDomain::Permit, "P1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.fields.get("status"), Some(&json!("dibatalkan")));
    }

    #[tokio::test]
    async fn unknown_and_reserved_columns_are_rejected() {
        let (store, _) = setup_db();
        let row = store
            .create(SyncDomain::Presence, "R1", FieldMap::new())
            .await
            .unwrap();
        assert!(store
            .quiet_update(SyncDomain::Presence, &row, fields(json!({ "salary": 1 })))
            .await
            .is_err());
        assert!(store
            .quiet_update(SyncDomain::Presence, &row, fields(json!({ "stable_id": "X" })))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn quoted_values_survive_round_trip() {
        let (store, _) = setup_db();
        let row = store
            .create(SyncDomain::Employee, "E'1", fields(json!({ "name": "O'Brien" })))
            .await
            .unwrap();
        assert_eq!(row.stable_id, "E'1");
        assert_eq!(row.fields.get("name"), Some(&json!("O'Brien")));
    }

    #[tokio::test]
    async fn delete_removes_row_and_enqueues_event() {
        let (store, outbox) = setup_db();
        let row = store
            .create(SyncDomain::Presence, "R1", FieldMap::new())
            .await
            .unwrap();
        store.delete(SyncDomain::Presence, &row).await.unwrap();
        assert!(store
            .find_by_stable_id(SyncDomain::Presence, "R1")
            .await
            .unwrap()
            .is_none());
        assert_eq!(outbox.list_pending(10).unwrap()[0].op, OutboxOp::Delete);
    }

    #[tokio::test]
    async fn reconciliation_against_sqlite_is_idempotent_and_quiet() {
        let (store, outbox) = setup_db();
        let local = Arc::new(store);
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote
            .put(
                SyncDomain::Employee,
                RemoteRecord::new(
                    "E1",
                    fields(json!({ "name": " Alice ", "email": "ALICE@EXAMPLE.COM", "status": "aktif" })),
                ),
            )
            .await;
        let engine = ReconciliationEngine::new(remote.clone(), local.clone());

        let first = engine.reconcile(SyncDomain::Employee).await.unwrap();
        assert_eq!(first.created, 1);
        let second = engine.reconcile(SyncDomain::Employee).await.unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 0);
        assert_eq!(second.no_changes, 1);

        let row = local
            .find_by_stable_id(SyncDomain::Employee, "E1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.fields.get("email"), Some(&json!("alice@example.com")));
        assert_eq!(outbox.count_pending().unwrap(), 0);
    }

    #[tokio::test]
    async fn relay_pushes_pending_events_in_order_then_prunes() {
        let (store, outbox) = setup_db();
        let remote = InMemoryRemoteStore::new();
        remote
            .put(
                SyncDomain::Employee,
                RemoteRecord::new("E1", fields(json!({ "phone_number": "0811" }))),
            )
            .await;
        let row = store
            .create(SyncDomain::Employee, "E1", fields(json!({ "phone": "0811" })))
            .await
            .unwrap();
        store
            .update(SyncDomain::Employee, &row, fields(json!({ "phone": "0899" })))
            .await
            .unwrap();

        remote.set_unavailable(true).await;
        let blocked = outbox.relay(&remote, 10).await.unwrap();
        assert_eq!(blocked, RelaySummary { sent: 0, remaining: 1 });
        assert_eq!(outbox.count_pending().unwrap(), 1);

        remote.set_unavailable(false).await;
        let relayed = outbox.relay(&remote, 10).await.unwrap();
        assert_eq!(relayed.sent, 1);
        assert_eq!(outbox.count_pending().unwrap(), 0);
        let doc = remote
            .get_by_id(SyncDomain::Employee, "E1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(doc.fields.get("phone_number"), Some(&json!("0899")));

        let past = chrono::Utc::now() - chrono::Duration::hours(1);
        assert_eq!(outbox.prune_sent(past).await.unwrap(), 0);
        let future = chrono::Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(outbox.prune_sent(future).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn empty_remote_status_stays_null_across_scans() {
        let (store, _) = setup_db();
        let local = Arc::new(store);
        let remote = Arc::new(InMemoryRemoteStore::new());
        remote
            .put(
                SyncDomain::Employee,
                RemoteRecord::new("E1", fields(json!({ "name": "Alice", "status": "" }))),
            )
            .await;
        let engine = ReconciliationEngine::new(remote.clone(), local.clone());

        let first = engine.reconcile(SyncDomain::Employee).await.unwrap();
        assert_eq!(first.created, 1);
        let row = local
            .find_by_stable_id(SyncDomain::Employee, "E1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.fields.get("status"), Some(&Value::Null));

        let second = engine.reconcile(SyncDomain::Employee).await.unwrap();
        assert_eq!(second.updated, 0);
        assert_eq!(second.no_changes, 1);
    }
}
