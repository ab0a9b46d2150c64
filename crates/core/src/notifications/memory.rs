//! In-memory notification collaborators for local development and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;

use super::model::{
    Delivery, DeviceToken, JobStatus, NotificationJob, PushMessage, PushResponse, RecipientRef,
};
use super::stores::{NotificationRepository, PushTransport, RecipientDirectory, TokenStore};
use crate::errors::{Error, Result};

#[derive(Debug, Default)]
pub struct InMemoryTokenStore {
    tokens: Mutex<Vec<DeviceToken>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a token record without the per-device upsert.
    pub async fn push_raw(&self, token: DeviceToken) {
        self.tokens.lock().await.push(token);
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn list_tokens(&self, recipient: &RecipientRef) -> Result<Vec<DeviceToken>> {
        Ok(self
            .tokens
            .lock()
            .await
            .iter()
            .filter(|t| &t.recipient == recipient)
            .cloned()
            .collect())
    }

    async fn add_token(&self, token: &DeviceToken) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        match tokens
            .iter_mut()
            .find(|t| t.recipient == token.recipient && t.device_id == token.device_id)
        {
            Some(existing) if existing.last_used_at <= token.last_used_at => {
                *existing = token.clone();
            }
            Some(_) => {}
            None => tokens.push(token.clone()),
        }
        Ok(())
    }

    async fn remove_token(&self, recipient: &RecipientRef, device_id: &str) -> Result<()> {
        self.tokens
            .lock()
            .await
            .retain(|t| !(&t.recipient == recipient && t.device_id == device_id));
        Ok(())
    }

    async fn touch_token(
        &self,
        recipient: &RecipientRef,
        device_id: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        for token in self
            .tokens
            .lock()
            .await
            .iter_mut()
            .filter(|t| &t.recipient == recipient && t.device_id == device_id)
        {
            token.last_used_at = at;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryNotificationRepository {
    jobs: Mutex<Vec<NotificationJob>>,
}

impl InMemoryNotificationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn all(&self) -> Vec<NotificationJob> {
        self.jobs.lock().await.clone()
    }

    pub async fn count_with_status(&self, status: JobStatus) -> usize {
        self.jobs
            .lock()
            .await
            .iter()
            .filter(|j| j.status == status)
            .count()
    }
}

fn job_not_found(id: &str) -> Error {
    Error::Database(crate::errors::DatabaseError::NotFound(format!(
        "notification job {}",
        id
    )))
}

#[async_trait]
impl NotificationRepository for InMemoryNotificationRepository {
    async fn insert(&self, job: &NotificationJob) -> Result<()> {
        self.jobs.lock().await.push(job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<NotificationJob>> {
        Ok(self.jobs.lock().await.iter().find(|j| j.id == id).cloned())
    }

    async fn record_delivery(&self, id: &str, delivery: &Delivery) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| job_not_found(id))?;
        job.status = delivery.status;
        job.channel_token = delivery.channel_token.clone();
        job.sent_at = delivery.sent_at;
        job.message_id = delivery.message_id.clone();
        job.error = delivery.error.clone();
        Ok(())
    }

    async fn mark_read(&self, id: &str, at: DateTime<Utc>) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        match jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                if job.read_at.is_none() {
                    job.read_at = Some(at);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn claim_due(&self, now: DateTime<Utc>) -> Result<Vec<NotificationJob>> {
        let mut claimed = Vec::new();
        for job in self.jobs.lock().await.iter_mut().filter(|j| {
            j.status == JobStatus::Scheduled && j.scheduled_at.map(|at| at <= now).unwrap_or(false)
        }) {
            job.status = JobStatus::Pending;
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn recent_similar(
        &self,
        recipient: &RecipientRef,
        title: &str,
        kind: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<NotificationJob>> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| {
                &j.recipient == recipient
                    && j.title == title
                    && j.kind == kind
                    && j.created_at >= since
            })
            .cloned()
            .collect())
    }

    async fn list_for_recipient(&self, recipient: &RecipientRef) -> Result<Vec<NotificationJob>> {
        Ok(self
            .jobs
            .lock()
            .await
            .iter()
            .filter(|j| &j.recipient == recipient)
            .cloned()
            .collect())
    }
}

/// Transport that records every message. Tokens marked rejected get
/// `accepted = false`.
#[derive(Debug, Default)]
pub struct RecordingPushTransport {
    sent: Mutex<Vec<PushMessage>>,
    rejected: Mutex<HashSet<String>>,
    counter: AtomicUsize,
}

impl RecordingPushTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn reject_token(&self, token: &str) {
        self.rejected.lock().await.insert(token.to_string());
    }

    pub async fn sent(&self) -> Vec<PushMessage> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl PushTransport for RecordingPushTransport {
    async fn send(&self, message: &PushMessage) -> Result<PushResponse> {
        self.sent.lock().await.push(message.clone());
        if self.rejected.lock().await.contains(&message.token) {
            return Ok(PushResponse::rejected("UNREGISTERED"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(PushResponse::accepted(format!("msg-{}", n)))
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRecipientDirectory {
    recipients: Vec<RecipientRef>,
}

impl InMemoryRecipientDirectory {
    pub fn new(recipients: Vec<RecipientRef>) -> Self {
        Self { recipients }
    }
}

#[async_trait]
impl RecipientDirectory for InMemoryRecipientDirectory {
    async fn all_recipients(&self) -> Result<Vec<RecipientRef>> {
        Ok(self.recipients.clone())
    }
}
