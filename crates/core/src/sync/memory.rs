//! In-memory store implementations for local development and tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::domain::{value_to_string, DomainSpec, FieldMap, LocalRow, RemoteRecord, SyncDomain};
use super::stores::{ListOptions, LocalStore, RemoteStore};
use crate::errors::{DatabaseError, Error, Result};

/// Remote store held in memory. Listings with `use_cache` are served from the
/// last snapshot until a write through this store invalidates it.
#[derive(Debug, Default)]
pub struct InMemoryRemoteStore {
    documents: Mutex<HashMap<SyncDomain, Vec<RemoteRecord>>>,
    snapshots: Mutex<HashMap<SyncDomain, Vec<RemoteRecord>>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
    lists: AtomicUsize,
}

impl InMemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds or replaces a document without counting as a client write.
    pub async fn put(&self, domain: SyncDomain, record: RemoteRecord) {
        {
            let mut documents = self.documents.lock().await;
            let entries = documents.entry(domain).or_default();
            match entries.iter_mut().find(|r| r.id.is_some() && r.id == record.id) {
                Some(existing) => *existing = record,
                None => entries.push(record),
            }
        }
        self.invalidate(domain).await;
    }

    /// Appends a document as-is, including documents without an id.
    pub async fn push_raw(&self, domain: SyncDomain, record: RemoteRecord) {
        self.documents
            .lock()
            .await
            .entry(domain)
            .or_default()
            .push(record);
        self.invalidate(domain).await;
    }

    /// Removes a document but leaves cached snapshots stale.
    pub async fn remove(&self, domain: SyncDomain, id: &str) {
        if let Some(entries) = self.documents.lock().await.get_mut(&domain) {
            entries.retain(|r| r.id.as_deref() != Some(id));
        }
    }

    pub async fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of create/update/delete calls received through the trait.
    pub async fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `list` calls received, cached or not.
    pub fn list_count(&self) -> usize {
        self.lists.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::remote("in-memory remote store marked unavailable"));
        }
        Ok(())
    }

    async fn invalidate(&self, domain: SyncDomain) {
        self.snapshots.lock().await.remove(&domain);
    }
}

fn project(domain: SyncDomain, record: &RemoteRecord) -> RemoteRecord {
    let keys = DomainSpec::for_domain(domain).remote_projection();
    let fields = record
        .fields
        .iter()
        .filter(|(k, _)| keys.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    RemoteRecord {
        id: record.id.clone(),
        fields,
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemoteStore {
    async fn list(&self, domain: SyncDomain, options: ListOptions) -> Result<Vec<RemoteRecord>> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.check_available()?;
        if options.use_cache {
            if let Some(snapshot) = self.snapshots.lock().await.get(&domain) {
                return Ok(snapshot.clone());
            }
        }
        let records = self
            .documents
            .lock()
            .await
            .get(&domain)
            .cloned()
            .unwrap_or_default();
        let records = if options.minimal {
            records.iter().map(|r| project(domain, r)).collect::<Vec<_>>()
        } else {
            records
        };
        self.snapshots.lock().await.insert(domain, records.clone());
        Ok(records)
    }

    async fn get_by_id(&self, domain: SyncDomain, id: &str) -> Result<Option<RemoteRecord>> {
        self.check_available()?;
        Ok(self
            .documents
            .lock()
            .await
            .get(&domain)
            .and_then(|entries| entries.iter().find(|r| r.id.as_deref() == Some(id)).cloned()))
    }

    async fn search_by_field(
        &self,
        domain: SyncDomain,
        field: &str,
        value: &str,
    ) -> Result<Vec<RemoteRecord>> {
        self.check_available()?;
        Ok(self
            .documents
            .lock()
            .await
            .get(&domain)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|r| r.fields.get(field).map(value_to_string).as_deref() == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create(&self, domain: SyncDomain, id: &str, data: &FieldMap) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.put(domain, RemoteRecord::new(id, data.clone())).await;
        Ok(())
    }

    async fn update(&self, domain: SyncDomain, id: &str, data: &FieldMap) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut documents = self.documents.lock().await;
        let entries = documents.entry(domain).or_default();
        match entries.iter_mut().find(|r| r.id.as_deref() == Some(id)) {
            Some(existing) => existing.fields.extend(data.clone()),
            None => entries.push(RemoteRecord::new(id, data.clone())),
        }
        drop(documents);
        self.invalidate(domain).await;
        Ok(())
    }

    async fn delete(&self, domain: SyncDomain, id: &str) -> Result<()> {
        self.check_available()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.remove(domain, id).await;
        self.invalidate(domain).await;
        Ok(())
    }
}

/// A write-back the local store would have propagated to the remote store.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteBack {
    pub domain: SyncDomain,
    pub stable_id: String,
    pub fields: FieldMap,
}

/// Local store held in memory, with the same quiet/loud write split as the
/// SQLite implementation.
#[derive(Debug)]
pub struct InMemoryLocalStore {
    rows: Mutex<HashMap<SyncDomain, Vec<LocalRow>>>,
    next_id: AtomicI64,
    write_backs: Mutex<Vec<WriteBack>>,
    failing: Mutex<HashSet<String>>,
}

impl Default for InMemoryLocalStore {
    fn default() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            write_backs: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
        }
    }
}

impl InMemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write to `stable_id` fail.
    pub async fn fail_writes_for(&self, stable_id: &str) {
        self.failing.lock().await.insert(stable_id.to_string());
    }

    pub async fn write_back_count(&self) -> usize {
        self.write_backs.lock().await.len()
    }

    pub async fn write_backs(&self) -> Vec<WriteBack> {
        self.write_backs.lock().await.clone()
    }

    pub async fn row_count(&self, domain: SyncDomain) -> usize {
        self.rows
            .lock()
            .await
            .get(&domain)
            .map(Vec::len)
            .unwrap_or(0)
    }

    async fn check_writable(&self, stable_id: &str) -> Result<()> {
        if self.failing.lock().await.contains(stable_id) {
            return Err(Error::Database(DatabaseError::QueryFailed(format!(
                "write rejected for '{}'",
                stable_id
            ))));
        }
        Ok(())
    }

    async fn merge(&self, domain: SyncDomain, row: &LocalRow, fields: &FieldMap) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let existing = rows
            .get_mut(&domain)
            .and_then(|entries| entries.iter_mut().find(|r| r.local_id == row.local_id))
            .ok_or_else(|| {
                Error::Database(DatabaseError::NotFound(format!(
                    "{} row {}",
                    domain, row.stable_id
                )))
            })?;
        existing.fields.extend(fields.clone());
        Ok(())
    }
}

#[async_trait]
impl LocalStore for InMemoryLocalStore {
    async fn find_by_stable_id(
        &self,
        domain: SyncDomain,
        stable_id: &str,
    ) -> Result<Option<LocalRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .get(&domain)
            .and_then(|entries| entries.iter().find(|r| r.stable_id == stable_id).cloned()))
    }

    async fn list(&self, domain: SyncDomain) -> Result<Vec<LocalRow>> {
        Ok(self
            .rows
            .lock()
            .await
            .get(&domain)
            .cloned()
            .unwrap_or_default())
    }

    async fn create(
        &self,
        domain: SyncDomain,
        stable_id: &str,
        fields: FieldMap,
    ) -> Result<LocalRow> {
        self.check_writable(stable_id).await?;
        let mut rows = self.rows.lock().await;
        let entries = rows.entry(domain).or_default();
        if entries.iter().any(|r| r.stable_id == stable_id) {
            return Err(Error::Database(DatabaseError::QueryFailed(format!(
                "UNIQUE constraint failed: {}.stable_id",
                domain.table_name()
            ))));
        }
        let row = LocalRow {
            local_id: self.next_id.fetch_add(1, Ordering::SeqCst),
            stable_id: stable_id.to_string(),
            fields,
        };
        entries.push(row.clone());
        Ok(row)
    }

    async fn quiet_update(
        &self,
        domain: SyncDomain,
        row: &LocalRow,
        fields: FieldMap,
    ) -> Result<()> {
        self.check_writable(&row.stable_id).await?;
        self.merge(domain, row, &fields).await
    }

    async fn update(&self, domain: SyncDomain, row: &LocalRow, fields: FieldMap) -> Result<()> {
        self.check_writable(&row.stable_id).await?;
        self.merge(domain, row, &fields).await?;
        self.write_backs.lock().await.push(WriteBack {
            domain,
            stable_id: row.stable_id.clone(),
            fields,
        });
        Ok(())
    }

    async fn mark_inactive(&self, domain: SyncDomain, row: &LocalRow) -> Result<()> {
        self.check_writable(&row.stable_id).await?;
        let spec = DomainSpec::for_domain(domain);
        let mut fields = FieldMap::new();
        fields.insert(
            spec.status_column.to_string(),
            serde_json::Value::String(spec.inactive_status.to_string()),
        );
        self.merge(domain, row, &fields).await
    }

    async fn delete(&self, domain: SyncDomain, row: &LocalRow) -> Result<()> {
        self.check_writable(&row.stable_id).await?;
        if let Some(entries) = self.rows.lock().await.get_mut(&domain) {
            entries.retain(|r| r.local_id != row.local_id);
        }
        Ok(())
    }
}
