//! SQLite storage for reconciled domains, the write-back outbox and the
//! shared key-value store.

mod kv;
pub mod outbox;
mod records;

pub use kv::{KvEntryDB, SqliteKeyValueStore};
pub use outbox::{
    write_outbox_event, OutboxEvent, OutboxOp, OutboxRepository, OutboxStatus, RelaySummary,
    OutboxWriteRequest, SyncOutboxEventDB,
};
pub use records::SqliteLocalStore;
