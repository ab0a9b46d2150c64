//! Attendance sync service: webhook intake, reconciliation scheduler and
//! push notification dispatch behind one HTTP server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use attendsync_core::notifications::NotificationDispatchEngine;

mod api;
mod config;
mod error;
mod main_lib;

use config::ServerConfig;
use main_lib::Maintenance;

/// Outbox events pushed to the remote store per sweep.
const OUTBOX_RELAY_BATCH: i64 = 100;

/// Sent outbox events are kept this long.
const OUTBOX_RETENTION_DAYS: i64 = 7;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,attendsync=debug")),
        )
        .init();
}

/// Periodically sends due scheduled notifications, relays the write-back
/// outbox and purges expired key-value entries and old outbox rows.
fn spawn_sweeper(
    dispatcher: Arc<NotificationDispatchEngine>,
    maintenance: Maintenance,
    every: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(err) = dispatcher.process_due().await {
                error!("[Sweeper] processing due notifications failed: {}", err);
            }
            match maintenance
                .outbox
                .relay(maintenance.remote.as_ref(), OUTBOX_RELAY_BATCH)
                .await
            {
                Ok(summary) if summary.sent > 0 || summary.remaining > 0 => info!(
                    "[Sweeper] outbox relayed={} remaining={}",
                    summary.sent, summary.remaining
                ),
                Ok(_) => {}
                Err(err) => error!("[Sweeper] outbox relay failed: {}", err),
            }
            let cutoff = chrono::Utc::now() - chrono::Duration::days(OUTBOX_RETENTION_DAYS);
            if let Err(err) = maintenance.outbox.prune_sent(cutoff).await {
                warn!("[Sweeper] outbox prune failed: {}", err);
            }
            match maintenance.kv_store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => info!("[Sweeper] purged {} expired entries", removed),
                Err(err) => warn!("[Sweeper] purge failed: {}", err),
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("[Server] failed to listen for shutdown signal: {}", err);
    }
    info!("[Server] shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = ServerConfig::from_env().context("loading configuration")?;
    let (state, maintenance) =
        main_lib::build_state(&config).context("initialising services")?;

    for domain in &config.sync_autostart {
        let scheduler = state.schedulers.get(*domain)?;
        match scheduler.start().await {
            Ok(outcome) => info!("[Server] autostart {}: {:?}", domain, outcome),
            Err(err) => warn!("[Server] autostart {} failed: {}", domain, err),
        }
    }

    let sweeper = spawn_sweeper(
        Arc::clone(&state.dispatcher),
        maintenance,
        config.notification_sweep,
    );

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!("[Server] listening on {}", config.listen_addr);

    axum::serve(listener, api::app_router(Arc::clone(&state)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    sweeper.abort();
    state.schedulers.stop_all().await;
    info!("[Server] stopped");
    Ok(())
}
