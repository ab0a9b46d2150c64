//! Collaborator contracts used by the notification subsystem.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::model::{Delivery, DeviceToken, NotificationJob, PushMessage, PushResponse, RecipientRef};
use crate::errors::Result;

/// Push channel. A rejected message is `Ok` with `accepted = false`; `Err`
/// is reserved for failures to reach the channel at all.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(&self, message: &PushMessage) -> Result<PushResponse>;
}

/// Per-recipient device token collection held by the remote store.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn list_tokens(&self, recipient: &RecipientRef) -> Result<Vec<DeviceToken>>;

    /// Upserts the token for `(recipient, device_id)`.
    async fn add_token(&self, token: &DeviceToken) -> Result<()>;

    async fn remove_token(&self, recipient: &RecipientRef, device_id: &str) -> Result<()>;

    async fn touch_token(
        &self,
        recipient: &RecipientRef,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

/// Persisted notification jobs.
#[async_trait]
pub trait NotificationRepository: Send + Sync {
    async fn insert(&self, job: &NotificationJob) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Option<NotificationJob>>;

    /// Records the outcome of one send attempt.
    async fn record_delivery(&self, id: &str, delivery: &Delivery) -> Result<()>;

    /// Stamps `read_at`. Returns `false` when the job does not exist.
    async fn mark_read(&self, id: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Flips every `scheduled` job due at `now` to `pending` and returns the
    /// flipped jobs. Jobs already claimed are never returned twice.
    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>>;

    /// Jobs for `recipient` with the same title and type created at or after `since`.
    async fn recent_similar(
        &self,
        recipient: &RecipientRef,
        title: &str,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<NotificationJob>>;

    async fn list_for_recipient(&self, recipient: &RecipientRef) -> Result<Vec<NotificationJob>>;
}

/// Source of every active recipient for broadcasts.
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    async fn all_recipients(&self) -> Result<Vec<RecipientRef>>;
}
