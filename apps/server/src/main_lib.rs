use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use attendsync_core::cache::KeyValueStore;
use attendsync_core::errors::Result;
use attendsync_core::notifications::{
    DedupConfig, DispatchConfig, DispatchStores, DuplicateSuppressor, NotificationDispatchEngine,
    NotificationRepository, PermitStatusNotifier, PushMessage, PushResponse, PushTransport,
    RecipientDirectory, TokenStore,
};
use attendsync_core::sync::{
    ChangeEventRouter, LocalStore, ReconciliationEngine, RemoteStore, SchedulerConfig,
    SchedulerSet, SignatureVerifier, SYNC_DOMAINS,
};
use attendsync_remote::{HttpPushTransport, PushConfig, RemoteStoreClient, RemoteStoreConfig};
use attendsync_storage_sqlite::{
    create_pool, init, run_migrations, spawn_writer, OutboxRepository, SqliteKeyValueStore,
    SqliteLocalStore, SqliteNotificationRepository, SqliteRecipientDirectory,
};

use crate::config::ServerConfig;

/// Shared handles behind every route.
pub struct AppState {
    pub schedulers: Arc<SchedulerSet>,
    pub engine: Arc<ReconciliationEngine>,
    pub change_router: Arc<ChangeEventRouter>,
    pub dispatcher: Arc<NotificationDispatchEngine>,
    pub verifier: SignatureVerifier,
}

/// Store-level collaborators the state is assembled from.
pub struct Collaborators {
    pub remote: Arc<dyn RemoteStore>,
    pub local: Arc<dyn LocalStore>,
    pub kv: Arc<dyn KeyValueStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub jobs: Arc<dyn NotificationRepository>,
    pub transport: Arc<dyn PushTransport>,
    pub directory: Arc<dyn RecipientDirectory>,
}

impl AppState {
    pub fn assemble(
        parts: Collaborators,
        scheduler_config: SchedulerConfig,
        webhook_secret: Option<String>,
    ) -> Arc<Self> {
        let engine = Arc::new(ReconciliationEngine::new(
            parts.remote,
            Arc::clone(&parts.local),
        ));
        let schedulers = Arc::new(SchedulerSet::new(
            Arc::clone(&engine),
            parts.kv.clone(),
            &SYNC_DOMAINS,
            scheduler_config,
        ));

        let suppressor = DuplicateSuppressor::new(
            parts.kv,
            Arc::clone(&parts.jobs),
            DedupConfig::default(),
        );
        let dispatcher = Arc::new(
            NotificationDispatchEngine::new(
                DispatchStores {
                    tokens: parts.tokens,
                    jobs: parts.jobs,
                    transport: parts.transport,
                    directory: parts.directory,
                },
                DispatchConfig::default(),
            )
            .with_suppressor(suppressor),
        );

        let change_router = Arc::new(
            ChangeEventRouter::new(parts.local)
                .with_listener(Arc::new(PermitStatusNotifier::new(Arc::clone(&dispatcher)))),
        );

        Arc::new(Self {
            schedulers,
            engine,
            change_router,
            dispatcher,
            verifier: SignatureVerifier::new(webhook_secret),
        })
    }
}

/// Stores touched only by the background sweeper.
pub struct Maintenance {
    pub kv_store: Arc<SqliteKeyValueStore>,
    pub outbox: Arc<OutboxRepository>,
    pub remote: Arc<dyn RemoteStore>,
}

/// Opens the database, builds the HTTP clients and wires every service.
pub fn build_state(config: &ServerConfig) -> Result<(Arc<AppState>, Maintenance)> {
    let db_path = init(&config.data_dir)?;
    run_migrations(&db_path)?;
    let pool = create_pool(&db_path)?;
    let writer = spawn_writer(pool.as_ref().clone());

    let kv_store = Arc::new(SqliteKeyValueStore::new(Arc::clone(&pool), writer.clone()));
    let local: Arc<dyn LocalStore> = Arc::new(SqliteLocalStore::new(
        Arc::clone(&pool),
        writer.clone(),
    ));
    let outbox = Arc::new(OutboxRepository::new(Arc::clone(&pool), writer.clone()));
    let jobs: Arc<dyn NotificationRepository> = Arc::new(SqliteNotificationRepository::new(
        Arc::clone(&pool),
        writer,
    ));
    let directory: Arc<dyn RecipientDirectory> =
        Arc::new(SqliteRecipientDirectory::new(Arc::clone(&pool)));

    let remote_config = RemoteStoreConfig::new(config.remote_store_url.clone())
        .with_token(config.remote_store_token.clone())
        .with_cache_ttl(config.remote_cache_ttl);
    let remote_client = Arc::new(RemoteStoreClient::new(remote_config)?);
    info!("[Server] remote store at {}", config.remote_store_url);

    let transport: Arc<dyn PushTransport> = match &config.push_api_url {
        Some(url) => {
            info!("[Server] push transport at {}", url);
            Arc::new(HttpPushTransport::new(PushConfig::new(
                url.clone(),
                config.push_server_key.clone(),
            ))?)
        }
        None => {
            warn!("[Server] PUSH_API_URL not set: push sends will be recorded as failed");
            Arc::new(UnconfiguredPushTransport)
        }
    };

    let scheduler_config = SchedulerConfig {
        interval_seconds: config.sync_interval_secs,
        ..SchedulerConfig::default()
    };

    let state = AppState::assemble(
        Collaborators {
            remote: remote_client.clone(),
            local,
            kv: kv_store.clone(),
            tokens: remote_client.clone(),
            jobs,
            transport,
            directory,
        },
        scheduler_config,
        config.webhook_secret.clone(),
    );
    let maintenance = Maintenance {
        kv_store,
        outbox,
        remote: remote_client,
    };
    Ok((state, maintenance))
}

/// Rejects every message so jobs are kept with a failure reason.
struct UnconfiguredPushTransport;

#[async_trait]
impl PushTransport for UnconfiguredPushTransport {
    async fn send(&self, _message: &PushMessage) -> Result<PushResponse> {
        Ok(PushResponse::rejected("PUSH_NOT_CONFIGURED"))
    }
}
