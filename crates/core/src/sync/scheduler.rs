//! Per-domain background sync loop with start/stop/force/status/health control.
//!
//! The running flag is a lease in the shared [`KeyValueStore`], so status and
//! force calls served by another process observe the same state as the loop.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::domain::SyncDomain;
use super::reconcile::{ReconcileSummary, ReconciliationEngine};
use crate::cache::KeyValueStore;
use crate::errors::{Error, Result};

/// Default cadence between cycles.
pub const SYNC_DEFAULT_INTERVAL_SECS: u64 = 300;

/// Lower bound accepted by `set_interval`.
pub const SYNC_MIN_INTERVAL_SECS: u64 = 60;

/// Sleep after a failed cycle before retrying.
pub const SYNC_ERROR_BACKOFF_SECS: u64 = 10;

/// Health degrades to warning once the last cycle is older than this many intervals.
pub const SYNC_STALENESS_FACTOR: u64 = 3;

/// Floor for the lease expiry.
pub const SYNC_LEASE_MIN_SECS: u64 = 180;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval_seconds: u64,
    pub min_interval_seconds: u64,
    pub error_backoff: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_seconds: SYNC_DEFAULT_INTERVAL_SECS,
            min_interval_seconds: SYNC_MIN_INTERVAL_SECS,
            error_backoff: Duration::from_secs(SYNC_ERROR_BACKOFF_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncHealth {
    Healthy,
    Warning,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: SyncHealth,
    pub message: String,
    pub last_run_at: Option<DateTime<Utc>>,
    pub seconds_since_last_run: Option<i64>,
}

/// Snapshot of a domain's run state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRunState {
    pub domain: SyncDomain,
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub interval_seconds: u64,
    pub health: SyncHealth,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub domain: SyncDomain,
    pub is_running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub interval_seconds: u64,
    pub is_due: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopped,
    NotRunning,
}

/// `now - last_run_at >= interval`. A domain that never ran is always due.
pub fn is_due(last_run_at: Option<DateTime<Utc>>, interval_seconds: u64, now: DateTime<Utc>) -> bool {
    match last_run_at {
        Some(at) => (now - at).num_seconds() >= interval_seconds as i64,
        None => true,
    }
}

/// Classifies scheduler health at `now`.
pub fn evaluate_health(
    is_running: bool,
    last_run_at: Option<DateTime<Utc>>,
    interval_seconds: u64,
    now: DateTime<Utc>,
) -> HealthReport {
    let seconds_since_last_run = last_run_at.map(|at| (now - at).num_seconds());
    if !is_running {
        return HealthReport {
            status: SyncHealth::Stopped,
            message: "Sync is not running".to_string(),
            last_run_at,
            seconds_since_last_run,
        };
    }

    let threshold = interval_seconds.saturating_mul(SYNC_STALENESS_FACTOR) as i64;
    let (status, message) = match seconds_since_last_run {
        None => (
            SyncHealth::Warning,
            "Sync is running but no cycle has completed yet".to_string(),
        ),
        Some(elapsed) if elapsed > threshold => (
            SyncHealth::Warning,
            format!(
                "Last completed cycle was {}s ago (staleness threshold {}s)",
                elapsed, threshold
            ),
        ),
        Some(elapsed) => (
            SyncHealth::Healthy,
            format!("Last completed cycle was {}s ago", elapsed),
        ),
    };

    HealthReport {
        status,
        message,
        last_run_at,
        seconds_since_last_run,
    }
}

fn lease_ttl(interval_seconds: u64) -> Duration {
    Duration::from_secs(
        interval_seconds
            .saturating_mul(SYNC_STALENESS_FACTOR)
            .max(SYNC_LEASE_MIN_SECS),
    )
}

/// Identity of one `start()`. A loop keeps running only while the lease holds
/// its id and it has not been cancelled.
#[derive(Debug, Clone)]
struct RunToken {
    id: String,
    cancelled: Arc<AtomicBool>,
}

impl RunToken {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

struct ActiveRun {
    token: RunToken,
    handle: JoinHandle<()>,
}

/// Drives `ReconciliationEngine::reconcile` for one domain.
pub struct SyncScheduler {
    domain: SyncDomain,
    engine: Arc<ReconciliationEngine>,
    kv: Arc<dyn KeyValueStore>,
    config: SchedulerConfig,
    cycle_mutex: Mutex<()>,
    active_run: Mutex<Option<ActiveRun>>,
    wake: Notify,
}

impl SyncScheduler {
    pub fn new(
        domain: SyncDomain,
        engine: Arc<ReconciliationEngine>,
        kv: Arc<dyn KeyValueStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            domain,
            engine,
            kv,
            config,
            cycle_mutex: Mutex::new(()),
            active_run: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn domain(&self) -> SyncDomain {
        self.domain
    }

    fn lease_key(&self) -> String {
        format!("sync:{}:lease", self.domain)
    }

    fn last_run_key(&self) -> String {
        format!("sync:{}:last_run_at", self.domain)
    }

    fn interval_key(&self) -> String {
        format!("sync:{}:interval", self.domain)
    }

    fn last_summary_key(&self) -> String {
        format!("sync:{}:last_summary", self.domain)
    }

    /// Current interval, preferring a value persisted by `set_interval`.
    pub async fn interval_seconds(&self) -> u64 {
        match self.kv.get(&self.interval_key()).await {
            Ok(Some(raw)) => raw.parse().unwrap_or(self.config.interval_seconds),
            Ok(None) => self.config.interval_seconds,
            Err(err) => {
                log::warn!(
                    "[SyncScheduler] {} failed to read interval: {}",
                    self.domain,
                    err
                );
                self.config.interval_seconds
            }
        }
    }

    async fn last_run_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw = self.kv.get(&self.last_run_key()).await?;
        Ok(raw
            .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    async fn is_running(&self) -> Result<bool> {
        Ok(self.kv.get(&self.lease_key()).await?.is_some())
    }

    async fn holds_lease(&self, token: &RunToken) -> bool {
        if token.is_cancelled() {
            return false;
        }
        match self.kv.get(&self.lease_key()).await {
            Ok(Some(owner)) => owner == token.id,
            Ok(None) => false,
            Err(err) => {
                // Keep running through a transient lease read failure.
                log::warn!(
                    "[SyncScheduler] {} lease check failed: {}",
                    self.domain,
                    err
                );
                true
            }
        }
    }

    async fn refresh_lease(&self, token: &RunToken) {
        if !self.holds_lease(token).await {
            return;
        }
        let ttl = lease_ttl(self.interval_seconds().await);
        if let Err(err) = self
            .kv
            .set(&self.lease_key(), &token.id, Some(ttl))
            .await
        {
            log::warn!(
                "[SyncScheduler] {} lease refresh failed: {}",
                self.domain,
                err
            );
        }
    }

    /// Acquires the lease and spawns the run loop. Idempotent.
    pub async fn start(self: &Arc<Self>) -> Result<StartOutcome> {
        let token = RunToken::new();
        let ttl = lease_ttl(self.interval_seconds().await);
        let acquired = self
            .kv
            .set_if_absent(&self.lease_key(), &token.id, Some(ttl))
            .await?;
        if !acquired {
            info!("[SyncScheduler] {} already running", self.domain);
            return Ok(StartOutcome::AlreadyRunning);
        }

        let mut guard = self.active_run.lock().await;
        if let Some(previous) = guard.take() {
            previous.token.cancel();
            if !previous.handle.is_finished() {
                debug!(
                    "[SyncScheduler] {} previous loop still draining its last cycle",
                    self.domain
                );
            }
        }

        let scheduler = Arc::clone(self);
        let loop_token = token.clone();
        let handle = tokio::spawn(async move {
            scheduler.run_loop(loop_token).await;
        });
        *guard = Some(ActiveRun { token, handle });
        info!("[SyncScheduler] {} started", self.domain);
        Ok(StartOutcome::Started)
    }

    async fn run_loop(self: Arc<Self>, token: RunToken) {
        loop {
            if !self.holds_lease(&token).await {
                info!("[SyncScheduler] {} loop exiting: lease released", self.domain);
                break;
            }
            self.refresh_lease(&token).await;

            let delay = match self.run_cycle().await {
                Ok(_) => Duration::from_secs(self.interval_seconds().await),
                Err(err) => {
                    log::error!(
                        "[SyncScheduler] {} cycle failed, retrying in {:?}: {}",
                        self.domain,
                        self.config.error_backoff,
                        err
                    );
                    self.config.error_backoff
                }
            };
            self.refresh_lease(&token).await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified() => {}
            }
        }
    }

    /// Cycles never overlap: the loop and forced runs share one mutex.
    async fn run_cycle(&self) -> Result<ReconcileSummary> {
        let _cycle_guard = self.cycle_mutex.lock().await;
        let summary = self.engine.reconcile(self.domain).await?;
        let now = Utc::now().to_rfc3339();
        self.kv.set(&self.last_run_key(), &now, None).await?;
        match serde_json::to_string(&summary) {
            Ok(serialized) => {
                if let Err(err) = self
                    .kv
                    .set(&self.last_summary_key(), &serialized, None)
                    .await
                {
                    log::warn!(
                        "[SyncScheduler] {} failed to store last summary: {}",
                        self.domain,
                        err
                    );
                }
            }
            Err(err) => log::warn!(
                "[SyncScheduler] {} failed to serialize summary: {}",
                self.domain,
                err
            ),
        }
        Ok(summary)
    }

    /// Releases the lease. An in-flight cycle finishes; no new cycle starts.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let was_running = self.is_running().await?;
        if let Some(active) = self.active_run.lock().await.take() {
            active.token.cancel();
        }
        self.kv
            .remove_many(&[self.lease_key(), self.last_run_key()])
            .await?;
        self.wake.notify_waiters();

        if was_running {
            info!("[SyncScheduler] {} stop requested", self.domain);
            Ok(StopOutcome::Stopped)
        } else {
            Ok(StopOutcome::NotRunning)
        }
    }

    /// Runs exactly one cycle now, regardless of the timer.
    pub async fn force_sync(&self) -> Result<ReconcileSummary> {
        info!("[SyncScheduler] {} forced cycle", self.domain);
        self.run_cycle().await
    }

    pub async fn status(&self) -> Result<SyncStatus> {
        let is_running = self.is_running().await?;
        let last_run_at = self.last_run_at().await?;
        let interval_seconds = self.interval_seconds().await;
        Ok(SyncStatus {
            domain: self.domain,
            is_running,
            last_run_at,
            interval_seconds,
            is_due: is_due(last_run_at, interval_seconds, Utc::now()),
        })
    }

    pub async fn health_check(&self) -> Result<HealthReport> {
        let status = self.status().await?;
        Ok(evaluate_health(
            status.is_running,
            status.last_run_at,
            status.interval_seconds,
            Utc::now(),
        ))
    }

    pub async fn run_state(&self) -> Result<SyncRunState> {
        let health = self.health_check().await?;
        let status = self.status().await?;
        Ok(SyncRunState {
            domain: self.domain,
            is_running: status.is_running,
            last_run_at: status.last_run_at,
            interval_seconds: status.interval_seconds,
            health: health.status,
        })
    }

    /// Summary of the last completed cycle, if any.
    pub async fn last_summary(&self) -> Result<Option<ReconcileSummary>> {
        match self.kv.get(&self.last_summary_key()).await? {
            Some(raw) => Ok(serde_json::from_str(&raw).ok()),
            None => Ok(None),
        }
    }

    /// Persists a new interval, clamped to the configured minimum. Returns the applied value.
    pub async fn set_interval(&self, seconds: u64) -> Result<u64> {
        let applied = seconds.max(self.config.min_interval_seconds);
        if applied != seconds {
            log::warn!(
                "[SyncScheduler] {} interval {}s below minimum, clamped to {}s",
                self.domain,
                seconds,
                applied
            );
        }
        self.kv
            .set(&self.interval_key(), &applied.to_string(), None)
            .await?;
        let current = self
            .active_run
            .lock()
            .await
            .as_ref()
            .map(|active| active.token.clone());
        if let Some(token) = current {
            self.refresh_lease(&token).await;
        }
        Ok(applied)
    }
}

/// One scheduler per domain, addressed by domain for the control surface.
pub struct SchedulerSet {
    schedulers: HashMap<SyncDomain, Arc<SyncScheduler>>,
}

impl SchedulerSet {
    pub fn new(
        engine: Arc<ReconciliationEngine>,
        kv: Arc<dyn KeyValueStore>,
        domains: &[SyncDomain],
        config: SchedulerConfig,
    ) -> Self {
        let schedulers = domains
            .iter()
            .map(|domain| {
                (
                    *domain,
                    Arc::new(SyncScheduler::new(
                        *domain,
                        Arc::clone(&engine),
                        Arc::clone(&kv),
                        config.clone(),
                    )),
                )
            })
            .collect();
        Self { schedulers }
    }

    pub fn get(&self, domain: SyncDomain) -> Result<Arc<SyncScheduler>> {
        self.schedulers
            .get(&domain)
            .cloned()
            .ok_or_else(|| Error::UnknownDomain(domain.to_string()))
    }

    pub fn domains(&self) -> Vec<SyncDomain> {
        let mut domains = self.schedulers.keys().copied().collect::<Vec<_>>();
        domains.sort_by_key(|d| d.as_str());
        domains
    }

    pub async fn stop_all(&self) {
        for scheduler in self.schedulers.values() {
            if let Err(err) = scheduler.stop().await {
                log::warn!(
                    "[SyncScheduler] {} failed to stop: {}",
                    scheduler.domain(),
                    err
                );
            }
        }
    }
}
