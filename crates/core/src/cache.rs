//! Shared key-value store with expiry, used for the scheduler lease and the
//! notification dedup cache.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::errors::Result;

/// Atomically-updatable key-value store. Implementations backed by a shared
/// database let separate processes observe the same entries.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Writes only when the key is absent or expired. Returns `true` when written.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Removes every key in one pass and returns how many existed.
    async fn remove_many(&self, keys: &[String]) -> Result<usize>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

/// Process-local store. Suitable for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if entries.get(key).map(|e| e.is_live(now)).unwrap_or(false) {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| now + ttl),
            },
        );
        Ok(true)
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn remove_many(&self, keys: &[String]) -> Result<usize> {
        let mut entries = self.entries.lock().await;
        Ok(keys.iter().filter(|k| entries.remove(*k).is_some()).count())
    }
}

/// Tracks which cache keys belong to which tag so a write can invalidate all
/// affected keys in a single pass. Draining never calls back into the tracker.
#[derive(Debug, Default)]
pub struct KeyTracker {
    keys_by_tag: std::sync::Mutex<HashMap<String, HashSet<String>>>,
}

impl KeyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, tag: &str, key: &str) {
        if let Ok(mut guard) = self.keys_by_tag.lock() {
            guard
                .entry(tag.to_string())
                .or_default()
                .insert(key.to_string());
        }
    }

    /// Removes and returns every key tracked under any of `tags`, deduplicated.
    pub fn drain(&self, tags: &[&str]) -> Vec<String> {
        let mut affected = HashSet::new();
        if let Ok(mut guard) = self.keys_by_tag.lock() {
            for tag in tags {
                if let Some(keys) = guard.remove(*tag) {
                    affected.extend(keys);
                }
            }
        }
        let mut keys = affected.into_iter().collect::<Vec<_>>();
        keys.sort();
        keys
    }
}
