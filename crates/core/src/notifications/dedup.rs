//! Suppresses logically identical notifications sent within a short window.

use chrono::Utc;
use log::debug;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::model::{JobStatus, NotificationContent, Payload, RecipientRef};
use super::stores::NotificationRepository;
use crate::cache::KeyValueStore;
use crate::errors::Result;

/// Look-back of the persisted-history tier.
pub const DEDUP_HISTORY_WINDOW_SECS: u64 = 15 * 60;

/// Cache tier length for kinds without an explicit entry.
pub const DEDUP_DEFAULT_CACHE_TTL_SECS: u64 = 5 * 60;

/// Payload keys that never identify the logical event.
const SURROGATE_ID_KEYS: &[&str] = &[
    "id",
    "notification_id",
    "document_id",
    "record_id",
    "permit_id",
    "presence_id",
];

const STATUS_CHANGED_FIELDS: &[&str] = &[
    "entity",
    "status",
    "employee_id",
    "permit_type",
    "start_date",
    "end_date",
];
const ATTENDANCE_REMINDER_FIELDS: &[&str] = &["date", "shift"];
const ANNOUNCEMENT_FIELDS: &[&str] = &["message"];

/// Payload fields that identify the event for a given notification type.
fn identifying_fields(kind: &str) -> Option<&'static [&'static str]> {
    match kind {
        "status_changed" => Some(STATUS_CHANGED_FIELDS),
        "attendance_reminder" => Some(ATTENDANCE_REMINDER_FIELDS),
        "announcement" => Some(ANNOUNCEMENT_FIELDS),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct DedupConfig {
    pub history_window: Duration,
    pub default_cache_ttl: Duration,
    pub cache_ttls: HashMap<String, Duration>,
}

impl Default for DedupConfig {
    fn default() -> Self {
        let cache_ttls = [
            ("status_changed", 15 * 60),
            ("attendance_reminder", 10 * 60),
            ("announcement", 5 * 60),
        ]
        .into_iter()
        .map(|(kind, secs)| (kind.to_string(), Duration::from_secs(secs)))
        .collect();
        Self {
            history_window: Duration::from_secs(DEDUP_HISTORY_WINDOW_SECS),
            default_cache_ttl: Duration::from_secs(DEDUP_DEFAULT_CACHE_TTL_SECS),
            cache_ttls,
        }
    }
}

impl DedupConfig {
    pub fn cache_ttl(&self, kind: &str) -> Duration {
        self.cache_ttls
            .get(kind)
            .copied()
            .unwrap_or(self.default_cache_ttl)
    }
}

#[derive(Serialize)]
struct FingerprintInput<'a> {
    recipient: String,
    title: &'a str,
    kind: &'a str,
    action: Option<&'a str>,
    fields: BTreeMap<&'a str, &'a str>,
}

/// Hex SHA-256 over the recipient, title, type, action and the type-specific
/// payload subset. Surrogate ids are excluded.
pub fn fingerprint(
    recipient: &RecipientRef,
    title: &str,
    kind: &str,
    action: Option<&str>,
    payload: &Payload,
) -> String {
    let fields = match identifying_fields(kind) {
        Some(keys) => keys
            .iter()
            .filter_map(|k| payload.get(*k).map(|v| (*k, v.as_str())))
            .collect(),
        None => payload
            .iter()
            .filter(|(k, _)| !SURROGATE_ID_KEYS.contains(&k.as_str()))
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect(),
    };
    let input = FingerprintInput {
        recipient: recipient.to_string(),
        title: title.trim(),
        kind,
        action,
        fields,
    };
    // BTreeMap keeps the serialized form canonical.
    let canonical = serde_json::to_vec(&input).unwrap_or_default();
    hex::encode(Sha256::digest(&canonical))
}

fn cache_key(fingerprint: &str) -> String {
    format!("notify:dedup:{}", fingerprint)
}

fn content_fingerprint(recipient: &RecipientRef, content: &NotificationContent) -> String {
    fingerprint(
        recipient,
        &content.title,
        &content.options.kind,
        content.options.action.as_deref(),
        &content.payload,
    )
}

/// Two-tier duplicate check: a short-TTL cache entry per fingerprint, then
/// persisted jobs from the history window.
pub struct DuplicateSuppressor {
    kv: Arc<dyn KeyValueStore>,
    jobs: Arc<dyn NotificationRepository>,
    config: DedupConfig,
}

impl DuplicateSuppressor {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        jobs: Arc<dyn NotificationRepository>,
        config: DedupConfig,
    ) -> Self {
        Self { kv, jobs, config }
    }

    /// Returns `true` when an identical notification was seen within the
    /// window. A `false` result claims the fingerprint for this send.
    pub async fn is_duplicate(
        &self,
        recipient: &RecipientRef,
        content: &NotificationContent,
    ) -> Result<bool> {
        let options = &content.options;
        let fp = content_fingerprint(recipient, content);
        let key = cache_key(&fp);
        let ttl = self.config.cache_ttl(&options.kind);

        if self.kv.get(&key).await?.is_some() {
            debug!("[Dedup] cache hit for {} ({})", recipient, options.kind);
            return Ok(true);
        }

        let window = chrono::Duration::from_std(self.config.history_window)
            .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let since = Utc::now() - window;
        let recent = self
            .jobs
            .recent_similar(recipient, &content.title, &options.kind, since)
            .await?;
        let seen_in_history = recent.iter().any(|job| {
            job.status != JobStatus::Failed
                && fingerprint(
                    &job.recipient,
                    &job.title,
                    &job.kind,
                    job.action.as_deref(),
                    &job.payload,
                ) == fp
        });
        if seen_in_history {
            debug!("[Dedup] history hit for {} ({})", recipient, options.kind);
            self.kv.set(&key, "1", Some(ttl)).await?;
            return Ok(true);
        }

        // A concurrent caller may claim the fingerprint between the checks.
        let claimed = self.kv.set_if_absent(&key, "1", Some(ttl)).await?;
        if !claimed {
            debug!("[Dedup] lost claim race for {} ({})", recipient, options.kind);
        }
        Ok(!claimed)
    }

    /// Drops the cached claim so a retry after a failed send is not suppressed.
    pub async fn release(&self, recipient: &RecipientRef, content: &NotificationContent) -> Result<()> {
        let key = cache_key(&content_fingerprint(recipient, content));
        self.kv.remove(&key).await?;
        debug!("[Dedup] released claim for {} ({})", recipient, content.options.kind);
        Ok(())
    }
}
