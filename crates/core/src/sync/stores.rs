//! Collaborator contracts for the two stores being reconciled.

use async_trait::async_trait;

use super::domain::{FieldMap, LocalRow, RemoteRecord, SyncDomain};
use crate::errors::Result;

/// Read options for a remote collection listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListOptions {
    /// Only fetch the fields named by the domain's mapping table.
    pub minimal: bool,
    /// Allow a cached snapshot to be served.
    pub use_cache: bool,
}

impl ListOptions {
    /// Projection used by the periodic scan.
    pub const fn scan() -> Self {
        Self {
            minimal: true,
            use_cache: true,
        }
    }

    /// Uncached read used before acting on removals.
    pub const fn fresh() -> Self {
        Self {
            minimal: true,
            use_cache: false,
        }
    }
}

impl Default for ListOptions {
    fn default() -> Self {
        Self {
            minimal: false,
            use_cache: true,
        }
    }
}

/// Document-oriented remote store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn list(&self, domain: SyncDomain, options: ListOptions) -> Result<Vec<RemoteRecord>>;

    async fn get_by_id(&self, domain: SyncDomain, id: &str) -> Result<Option<RemoteRecord>>;

    async fn search_by_field(
        &self,
        domain: SyncDomain,
        field: &str,
        value: &str,
    ) -> Result<Vec<RemoteRecord>>;

    async fn create(&self, domain: SyncDomain, id: &str, data: &FieldMap) -> Result<()>;

    async fn update(&self, domain: SyncDomain, id: &str, data: &FieldMap) -> Result<()>;

    async fn delete(&self, domain: SyncDomain, id: &str) -> Result<()>;
}

/// Relational local store. Every method that writes during reconciliation
/// (`create`, `quiet_update`, `mark_inactive`) must not trigger write-back to
/// the remote store; only `update` does.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn find_by_stable_id(&self, domain: SyncDomain, stable_id: &str)
        -> Result<Option<LocalRow>>;

    async fn list(&self, domain: SyncDomain) -> Result<Vec<LocalRow>>;

    async fn create(&self, domain: SyncDomain, stable_id: &str, fields: FieldMap)
        -> Result<LocalRow>;

    /// Update without emitting write-back events.
    async fn quiet_update(&self, domain: SyncDomain, row: &LocalRow, fields: FieldMap)
        -> Result<()>;

    /// Regular update that enqueues a write-back to the remote store.
    async fn update(&self, domain: SyncDomain, row: &LocalRow, fields: FieldMap) -> Result<()>;

    /// Soft removal: flips the domain's status column to its inactive value.
    async fn mark_inactive(&self, domain: SyncDomain, row: &LocalRow) -> Result<()>;

    /// Hard removal.
    async fn delete(&self, domain: SyncDomain, row: &LocalRow) -> Result<()>;
}
