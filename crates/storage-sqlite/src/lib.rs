//! SQLite storage for the attendance sync service.

pub mod db;
pub mod errors;
pub mod notifications;
pub mod schema;
pub mod sync;

pub use db::{create_pool, get_connection, init, run_migrations, spawn_writer, DbPool, WriteHandle};
pub use errors::StorageError;
pub use notifications::{SqliteNotificationRepository, SqliteRecipientDirectory};
pub use sync::{OutboxRepository, RelaySummary, SqliteKeyValueStore, SqliteLocalStore};
