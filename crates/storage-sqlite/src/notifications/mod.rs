//! SQLite persistence for notification jobs and the broadcast audience.

mod model;
mod repository;

pub use model::NotificationJobDB;
pub use repository::{SqliteNotificationRepository, SqliteRecipientDirectory};
