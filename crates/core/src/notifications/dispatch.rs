//! Fan-out of push notifications to every device of one or many recipients.

use chrono::{DateTime, Utc};
use log::{debug, info};
use std::sync::Arc;

use super::dedup::DuplicateSuppressor;
use super::model::{
    Delivery, DeviceToken, DispatchStatus, DispatchSummary, JobStatus, NotificationContent, NotificationJob,
    ProcessDueSummary, PushMessage, RecipientDispatch, RecipientRef, ResolvedRecipient,
    TokenOutcome,
};
use super::stores::{NotificationRepository, PushTransport, RecipientDirectory, TokenStore};
use crate::errors::{Error, Result};

/// Recipients handled per sequential batch.
pub const DISPATCH_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub batch_size: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_size: DISPATCH_BATCH_SIZE,
        }
    }
}

/// Store-level collaborators of the dispatch engine.
#[derive(Clone)]
pub struct DispatchStores {
    pub tokens: Arc<dyn TokenStore>,
    pub jobs: Arc<dyn NotificationRepository>,
    pub transport: Arc<dyn PushTransport>,
    pub directory: Arc<dyn RecipientDirectory>,
}

enum DedupCheck {
    Duplicate,
    /// This send owns the fingerprint until it completes.
    Claimed,
    Skipped,
}

pub struct NotificationDispatchEngine {
    tokens: Arc<dyn TokenStore>,
    jobs: Arc<dyn NotificationRepository>,
    transport: Arc<dyn PushTransport>,
    directory: Arc<dyn RecipientDirectory>,
    suppressor: Option<DuplicateSuppressor>,
    config: DispatchConfig,
}

impl NotificationDispatchEngine {
    pub fn new(stores: DispatchStores, config: DispatchConfig) -> Self {
        Self {
            tokens: stores.tokens,
            jobs: stores.jobs,
            transport: stores.transport,
            directory: stores.directory,
            suppressor: None,
            config,
        }
    }

    pub fn with_suppressor(mut self, suppressor: DuplicateSuppressor) -> Self {
        self.suppressor = Some(suppressor);
        self
    }

    pub fn jobs(&self) -> Arc<dyn NotificationRepository> {
        Arc::clone(&self.jobs)
    }

    /// Sends to every distinct device token of `recipient`. A suppressed
    /// duplicate and a token-less fallback both report success.
    pub async fn dispatch_to_recipient(
        &self,
        recipient: &RecipientRef,
        content: &NotificationContent,
    ) -> Result<RecipientDispatch> {
        let claimed = match self.check_duplicate(recipient, content).await {
            DedupCheck::Duplicate => {
                info!(
                    "[Dispatch] suppressed duplicate '{}' for {}",
                    content.title, recipient
                );
                return Ok(RecipientDispatch::suppressed(recipient.clone()));
            }
            DedupCheck::Claimed => true,
            DedupCheck::Skipped => false,
        };

        let result = self.fan_out(recipient, content, None).await;
        let failed = match &result {
            Ok(dispatch) => dispatch.status == DispatchStatus::Failed,
            Err(_) => true,
        };
        if claimed && failed {
            self.release_claim(recipient, content).await;
        }
        result
    }

    /// Dispatches to each recipient in sequential batches. One recipient's
    /// failure is reported in its entry and does not stop the others.
    pub async fn dispatch_to_many(
        &self,
        recipients: &[RecipientRef],
        content: &NotificationContent,
    ) -> DispatchSummary {
        let batch_size = self.config.batch_size.max(1);
        let mut results = Vec::with_capacity(recipients.len());
        for (index, batch) in recipients.chunks(batch_size).enumerate() {
            debug!(
                "[Dispatch] batch {} with {} recipients",
                index + 1,
                batch.len()
            );
            for recipient in batch {
                let result = match self.dispatch_to_recipient(recipient, content).await {
                    Ok(result) => result,
                    Err(err) => {
                        log::error!("[Dispatch] {} failed: {}", recipient, err);
                        RecipientDispatch::errored(recipient.clone(), &err)
                    }
                };
                results.push(result);
            }
        }
        let summary = DispatchSummary::from_results(results);
        info!(
            "[Dispatch] '{}' to {} recipients: succeeded={} failed={}",
            content.title, summary.total, summary.succeeded, summary.failed
        );
        summary
    }

    /// Broadcasts to every recipient known to the directory.
    pub async fn dispatch_to_all(&self, content: &NotificationContent) -> Result<DispatchSummary> {
        let recipients = self.directory.all_recipients().await?;
        Ok(self.dispatch_to_many(&recipients, content).await)
    }

    /// Stores a job to be sent by `process_due` once `due_at` has passed.
    pub async fn schedule_notification(
        &self,
        recipient: &RecipientRef,
        content: &NotificationContent,
        due_at: DateTime<Utc>,
    ) -> Result<NotificationJob> {
        let mut job = NotificationJob::new(recipient.clone(), content, JobStatus::Scheduled, None);
        job.scheduled_at = Some(due_at);
        self.jobs.insert(&job).await?;
        info!(
            "[Dispatch] scheduled '{}' for {} at {}",
            job.title,
            recipient,
            due_at.to_rfc3339()
        );
        Ok(job)
    }

    /// Claims scheduled jobs that are due and dispatches them. Safe to call
    /// repeatedly: claimed jobs leave the `scheduled` state.
    pub async fn process_due(&self) -> Result<ProcessDueSummary> {
        let claimed = self.jobs.claim_due(Utc::now()).await?;
        let mut summary = ProcessDueSummary {
            claimed: claimed.len(),
            ..ProcessDueSummary::default()
        };
        for job in claimed {
            let recipient = job.recipient.clone();
            let content = job.content();
            match self.fan_out(&recipient, &content, Some(job)).await {
                Ok(result) => match result.status {
                    DispatchStatus::Stored => summary.stored += 1,
                    _ if result.success => summary.sent += 1,
                    _ => summary.failed += 1,
                },
                Err(err) => {
                    log::error!("[Dispatch] due job for {} failed: {}", recipient, err);
                    summary.failed += 1;
                }
            }
        }
        if summary.claimed > 0 {
            info!(
                "[Dispatch] processed due jobs: claimed={} sent={} stored={} failed={}",
                summary.claimed, summary.sent, summary.stored, summary.failed
            );
        }
        Ok(summary)
    }

    /// Stamps `read_at` on a job. Delivery status is untouched.
    pub async fn mark_read(&self, job_id: &str) -> Result<bool> {
        self.jobs.mark_read(job_id, Utc::now()).await
    }

    /// Registers a device token; a newer registration for the same device replaces the older.
    pub async fn register_token(
        &self,
        recipient: &RecipientRef,
        device_id: &str,
        token: &str,
        platform: &str,
    ) -> Result<DeviceToken> {
        let device_id = device_id.trim();
        let token = token.trim();
        if device_id.is_empty() || token.is_empty() {
            return Err(Error::malformed("device_id and token are required"));
        }
        let now = Utc::now();
        let record = DeviceToken {
            recipient: recipient.clone(),
            device_id: device_id.to_string(),
            token: token.to_string(),
            platform: platform.trim().to_string(),
            created_at: now,
            last_used_at: now,
        };
        self.tokens.add_token(&record).await?;
        debug!("[Dispatch] registered token for {} device {}", recipient, device_id);
        Ok(record)
    }

    pub async fn remove_token(&self, recipient: &RecipientRef, device_id: &str) -> Result<()> {
        self.tokens.remove_token(recipient, device_id).await
    }

    async fn check_duplicate(
        &self,
        recipient: &RecipientRef,
        content: &NotificationContent,
    ) -> DedupCheck {
        let Some(suppressor) = self.suppressor.as_ref() else {
            return DedupCheck::Skipped;
        };
        if content.options.skip_dedup {
            return DedupCheck::Skipped;
        }
        match suppressor.is_duplicate(recipient, content).await {
            Ok(true) => DedupCheck::Duplicate,
            Ok(false) => DedupCheck::Claimed,
            Err(err) => {
                log::warn!(
                    "[Dispatch] duplicate check failed for {}, sending anyway: {}",
                    recipient,
                    err
                );
                DedupCheck::Claimed
            }
        }
    }

    async fn release_claim(&self, recipient: &RecipientRef, content: &NotificationContent) {
        let Some(suppressor) = self.suppressor.as_ref() else {
            return;
        };
        if let Err(err) = suppressor.release(recipient, content).await {
            log::warn!(
                "[Dispatch] failed to release dedup claim for {}: {}",
                recipient,
                err
            );
        }
    }

    /// Creates one job per distinct token and sends it. `anchor` is an
    /// already-persisted job reused for the first token.
    async fn fan_out(
        &self,
        recipient: &RecipientRef,
        content: &NotificationContent,
        mut anchor: Option<NotificationJob>,
    ) -> Result<RecipientDispatch> {
        let tokens = self.tokens.list_tokens(recipient).await?;
        let resolved = ResolvedRecipient::new(recipient.clone(), tokens);
        let distinct = resolved.distinct_tokens();

        if distinct.is_empty() {
            let job = match anchor {
                Some(job) => job,
                None => {
                    let job = NotificationJob::new(recipient.clone(), content, JobStatus::Pending, None);
                    self.jobs.insert(&job).await?;
                    job
                }
            };
            info!(
                "[Dispatch] no device tokens for {}, stored '{}' as pending",
                recipient, content.title
            );
            return Ok(RecipientDispatch::stored(recipient.clone(), job.id));
        }

        let mut outcomes = Vec::with_capacity(distinct.len());
        for token in &distinct {
            let job = match anchor.take() {
                Some(job) => job,
                None => {
                    let job = NotificationJob::new(
                        recipient.clone(),
                        content,
                        JobStatus::Pending,
                        Some(token.token.clone()),
                    );
                    self.jobs.insert(&job).await?;
                    job
                }
            };
            outcomes.push(self.send_job(&job, token).await);
        }

        let result = RecipientDispatch::from_tokens(recipient.clone(), outcomes);
        debug!(
            "[Dispatch] '{}' to {}: {:?} over {} tokens",
            content.title,
            recipient,
            result.status,
            result.tokens.len()
        );
        Ok(result)
    }

    async fn send_job(&self, job: &NotificationJob, token: &DeviceToken) -> TokenOutcome {
        let message = PushMessage::for_job(job, &token.token);
        let (delivery, outcome) = match self.transport.send(&message).await {
            Ok(response) if response.accepted => (
                Delivery::sent(&token.token, response.message_id.clone()),
                TokenOutcome {
                    job_id: job.id.clone(),
                    device_id: token.device_id.clone(),
                    accepted: true,
                    message_id: response.message_id,
                    error: None,
                },
            ),
            Ok(response) => {
                let error = response
                    .error_code
                    .unwrap_or_else(|| "rejected".to_string());
                (
                    Delivery::failed(&token.token, error.clone()),
                    TokenOutcome {
                        job_id: job.id.clone(),
                        device_id: token.device_id.clone(),
                        accepted: false,
                        message_id: None,
                        error: Some(error),
                    },
                )
            }
            Err(err) => {
                let error = Error::Transport(err.to_string()).to_string();
                (
                    Delivery::failed(&token.token, error.clone()),
                    TokenOutcome {
                        job_id: job.id.clone(),
                        device_id: token.device_id.clone(),
                        accepted: false,
                        message_id: None,
                        error: Some(error),
                    },
                )
            }
        };

        if let Err(err) = self.jobs.record_delivery(&job.id, &delivery).await {
            log::error!("[Dispatch] failed to record delivery for job {}: {}", job.id, err);
        }
        if outcome.accepted {
            if let Err(err) = self
                .tokens
                .touch_token(&job.recipient, &token.device_id, Utc::now())
                .await
            {
                log::warn!(
                    "[Dispatch] failed to touch token for {} device {}: {}",
                    job.recipient,
                    token.device_id,
                    err
                );
            }
        } else {
            log::warn!(
                "[Dispatch] send to {} device {} failed: {}",
                job.recipient,
                token.device_id,
                outcome.error.as_deref().unwrap_or("unknown")
            );
        }
        outcome
    }
}
