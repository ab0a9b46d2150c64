//! Notification domain models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::errors::{Error, Result};
use crate::sync::{value_to_string, FieldMap};

/// String-valued data attached to a push message.
pub type Payload = BTreeMap<String, String>;

/// Who a notification is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum RecipientRef {
    Employee(String),
    User(String),
}

impl RecipientRef {
    pub fn id(&self) -> &str {
        match self {
            Self::Employee(id) | Self::User(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Employee(_) => "employee",
            Self::User(_) => "user",
        }
    }

    /// Parses `employee:E1` / `user:42`. A bare id is treated as an employee.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        let (kind, id) = match value.split_once(':') {
            Some((kind, id)) => (kind, id.trim()),
            None => ("employee", value),
        };
        if id.is_empty() {
            return Err(Error::malformed("recipient id must not be empty"));
        }
        match kind {
            "employee" => Ok(Self::Employee(id.to_string())),
            "user" => Ok(Self::User(id.to_string())),
            other => Err(Error::malformed(format!("unknown recipient type '{}'", other))),
        }
    }
}

impl fmt::Display for RecipientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// A registered push channel for one device of one recipient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceToken {
    pub recipient: RecipientRef,
    pub device_id: String,
    pub token: String,
    pub platform: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

/// A recipient together with the tokens registered for it.
#[derive(Debug, Clone)]
pub struct ResolvedRecipient {
    pub recipient: RecipientRef,
    pub tokens: Vec<DeviceToken>,
}

impl ResolvedRecipient {
    pub fn new(recipient: RecipientRef, tokens: Vec<DeviceToken>) -> Self {
        Self { recipient, tokens }
    }

    pub fn id(&self) -> &str {
        self.recipient.id()
    }

    /// Most recently used token, if any.
    pub fn primary_token(&self) -> Option<&DeviceToken> {
        self.tokens.iter().max_by_key(|t| t.last_used_at)
    }

    /// One token per device (latest `last_used_at` wins), then one entry per
    /// distinct token string. Ordered by most recently used first.
    pub fn distinct_tokens(&self) -> Vec<DeviceToken> {
        let mut per_device: HashMap<&str, &DeviceToken> = HashMap::new();
        for token in &self.tokens {
            if token.token.trim().is_empty() {
                continue;
            }
            per_device
                .entry(token.device_id.as_str())
                .and_modify(|current| {
                    if token.last_used_at > current.last_used_at {
                        *current = token;
                    }
                })
                .or_insert(token);
        }

        let mut latest = per_device.into_values().collect::<Vec<_>>();
        latest.sort_by(|a, b| {
            b.last_used_at
                .cmp(&a.last_used_at)
                .then_with(|| a.device_id.cmp(&b.device_id))
        });

        let mut seen = HashSet::new();
        latest
            .into_iter()
            .filter(|t| seen.insert(t.token.clone()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Push channel priority vocabulary.
    pub fn channel_priority(&self) -> &'static str {
        match self {
            Self::Low | Self::Normal => "normal",
            Self::High | Self::Urgent => "high",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Sent,
    Failed,
    Scheduled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Scheduled => "scheduled",
        }
    }
}

/// One (logical notification, device token) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationJob {
    pub id: String,
    pub recipient: RecipientRef,
    pub title: String,
    pub body: String,
    /// Notification type, e.g. `status_changed`.
    pub kind: String,
    pub action: Option<String>,
    pub payload: Payload,
    pub channel_token: Option<String>,
    pub priority: Priority,
    pub status: JobStatus,
    pub message_id: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NotificationJob {
    pub fn new(
        recipient: RecipientRef,
        content: &NotificationContent,
        status: JobStatus,
        channel_token: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            recipient,
            title: content.title.clone(),
            body: content.body.clone(),
            kind: content.options.kind.clone(),
            action: content.options.action.clone(),
            payload: content.payload.clone(),
            channel_token,
            priority: content.options.priority,
            status,
            message_id: None,
            error: None,
            created_at: Utc::now(),
            sent_at: None,
            read_at: None,
            scheduled_at: None,
        }
    }

    pub fn content(&self) -> NotificationContent {
        NotificationContent {
            title: self.title.clone(),
            body: self.body.clone(),
            payload: self.payload.clone(),
            options: DispatchOptions {
                kind: self.kind.clone(),
                action: self.action.clone(),
                priority: self.priority,
                skip_dedup: true,
            },
        }
    }
}

/// Terminal state written after one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub status: JobStatus,
    pub channel_token: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl Delivery {
    pub fn sent(token: &str, message_id: Option<String>) -> Self {
        Self {
            status: JobStatus::Sent,
            channel_token: Some(token.to_string()),
            sent_at: Some(Utc::now()),
            message_id,
            error: None,
        }
    }

    pub fn failed(token: &str, error: impl Into<String>) -> Self {
        Self {
            status: JobStatus::Failed,
            channel_token: Some(token.to_string()),
            sent_at: None,
            message_id: None,
            error: Some(error.into()),
        }
    }
}

pub const DEFAULT_NOTIFICATION_KIND: &str = "general";

fn default_kind() -> String {
    DEFAULT_NOTIFICATION_KIND.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchOptions {
    #[serde(default = "default_kind", rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Bypass the duplicate suppressor.
    #[serde(default)]
    pub skip_dedup: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            kind: default_kind(),
            action: None,
            priority: Priority::Normal,
            skip_dedup: false,
        }
    }
}

impl DispatchOptions {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            ..Self::default()
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Everything about a logical notification except its recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    pub title: String,
    pub body: String,
    pub payload: Payload,
    pub options: DispatchOptions,
}

impl NotificationContent {
    /// Builds content from an arbitrary JSON payload, coercing values to strings.
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        payload: &FieldMap,
        options: DispatchOptions,
    ) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            payload: coerce_payload(payload),
            options,
        }
    }
}

pub fn coerce_payload(payload: &FieldMap) -> Payload {
    payload
        .iter()
        .map(|(k, v)| (k.clone(), value_to_string(v)))
        .collect()
}

/// Message handed to the push transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    pub token: String,
    pub title: String,
    pub body: String,
    pub data: Payload,
    /// Channel vocabulary: `normal` or `high`.
    pub priority: String,
}

impl PushMessage {
    pub fn for_job(job: &NotificationJob, token: &str) -> Self {
        let mut data = job.payload.clone();
        data.insert("type".to_string(), job.kind.clone());
        if let Some(action) = &job.action {
            data.insert("action".to_string(), action.clone());
        }
        data.insert("notification_id".to_string(), job.id.clone());
        Self {
            token: token.to_string(),
            title: job.title.clone(),
            body: job.body.clone(),
            data,
            priority: job.priority.channel_priority().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    pub accepted: bool,
    pub message_id: Option<String>,
    pub error_code: Option<String>,
}

impl PushResponse {
    pub fn accepted(message_id: impl Into<String>) -> Self {
        Self {
            accepted: true,
            message_id: Some(message_id.into()),
            error_code: None,
        }
    }

    pub fn rejected(error_code: impl Into<String>) -> Self {
        Self {
            accepted: false,
            message_id: None,
            error_code: Some(error_code.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    /// Every distinct token accepted the message.
    Sent,
    /// Some tokens accepted, some failed.
    Partial,
    /// Every send failed.
    Failed,
    /// No tokens: stored as a pending job for in-app history.
    Stored,
    /// Identical notification already delivered recently.
    Suppressed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenOutcome {
    pub job_id: String,
    pub device_id: String,
    pub accepted: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

/// Per-recipient dispatch result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientDispatch {
    pub recipient: RecipientRef,
    pub success: bool,
    pub status: DispatchStatus,
    pub job_ids: Vec<String>,
    pub tokens: Vec<TokenOutcome>,
    pub error: Option<String>,
}

impl RecipientDispatch {
    pub(crate) fn suppressed(recipient: RecipientRef) -> Self {
        Self {
            recipient,
            success: true,
            status: DispatchStatus::Suppressed,
            job_ids: Vec::new(),
            tokens: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn stored(recipient: RecipientRef, job_id: String) -> Self {
        Self {
            recipient,
            success: true,
            status: DispatchStatus::Stored,
            job_ids: vec![job_id],
            tokens: Vec::new(),
            error: None,
        }
    }

    pub(crate) fn errored(recipient: RecipientRef, error: &Error) -> Self {
        Self {
            recipient,
            success: false,
            status: DispatchStatus::Failed,
            job_ids: Vec::new(),
            tokens: Vec::new(),
            error: Some(error.to_string()),
        }
    }

    pub(crate) fn from_tokens(recipient: RecipientRef, tokens: Vec<TokenOutcome>) -> Self {
        let accepted = tokens.iter().filter(|t| t.accepted).count();
        let status = if accepted == tokens.len() {
            DispatchStatus::Sent
        } else if accepted == 0 {
            DispatchStatus::Failed
        } else {
            DispatchStatus::Partial
        };
        Self {
            recipient,
            success: accepted > 0,
            status,
            job_ids: tokens.iter().map(|t| t.job_id.clone()).collect(),
            tokens,
            error: None,
        }
    }
}

/// Result of a multi-recipient dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<RecipientDispatch>,
}

impl DispatchSummary {
    pub fn from_results(results: Vec<RecipientDispatch>) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            results,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessDueSummary {
    pub claimed: usize,
    pub sent: usize,
    pub stored: usize,
    pub failed: usize,
}
