// Wiring of the relay's shared services from `RelayConfig`.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use crate::{
    api::ApiState,
    auth::{IdentityVerifier, JwtIdentityVerifier},
    config::RelayConfig,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    presence::{PresenceRegistry, PresenceSweeper, SweeperHandle},
    sync::{
        persistence::{MemoryWorkspaceStore, PgWorkspaceStore, WorkspaceStateStore},
        DocumentStore, FlushPolicy, PersistenceGateway,
    },
    ws::{BroadcastRouter, RoomRegistry},
};

#[derive(Clone)]
pub struct RelayServices {
    pub config: Arc<RelayConfig>,
    pub documents: Arc<DocumentStore>,
    pub presence: PresenceRegistry,
    pub rooms: RoomRegistry,
    pub broadcast: BroadcastRouter,
    pub verifier: Arc<dyn IdentityVerifier>,
}

impl RelayServices {
    /// Connects durable storage (Postgres when a URL is configured) and
    /// assembles the document store, presence registry and broadcast router.
    pub async fn from_config(config: RelayConfig) -> anyhow::Result<Self> {
        let store: Arc<dyn WorkspaceStateStore> = match config.database_url.as_deref() {
            Some(database_url) => {
                let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
                check_pool_health(&pool).await?;
                run_migrations(&pool).await?;
                Arc::new(PgWorkspaceStore::new(pool))
            }
            None => {
                warn!("TANDEM_RELAY_DATABASE_URL not set, workspace state is kept in memory only");
                Arc::new(MemoryWorkspaceStore::new())
            }
        };

        let verifier: Arc<dyn IdentityVerifier> = Arc::new(
            JwtIdentityVerifier::new(&config.jwt_secret).context("invalid relay JWT secret")?,
        );
        Ok(Self::assemble(config, store, verifier))
    }

    /// Builds the services around an already constructed store and verifier.
    pub fn assemble(
        config: RelayConfig,
        store: Arc<dyn WorkspaceStateStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let flush_policy = FlushPolicy::from_limits(config.flush_every_updates, config.flush_interval);
        let documents = Arc::new(
            DocumentStore::new(config.update_log_limit)
                .with_resolver(config.merge_policy.resolver())
                .with_persistence(Arc::new(PersistenceGateway::new(store)), flush_policy),
        );
        let presence = PresenceRegistry::new();
        let rooms = RoomRegistry::new();
        let broadcast = BroadcastRouter::new(
            Arc::clone(&documents),
            presence.clone(),
            rooms.clone(),
            Arc::clone(&verifier),
        );

        info!(
            merge_policy = documents.resolver_name(),
            update_log_limit = documents.log_limit(),
            flush_every_updates = config.flush_every_updates,
            flush_interval_secs = config.flush_interval.as_secs(),
            "relay services ready"
        );

        Self { config: Arc::new(config), documents, presence, rooms, broadcast, verifier }
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            documents: Arc::clone(&self.documents),
            presence: self.presence.clone(),
            rooms: self.rooms.clone(),
        }
    }

    pub fn start_sweeper(&self) -> SweeperHandle {
        PresenceSweeper::new(
            self.presence.clone(),
            self.config.idle_after,
            self.config.expire_after,
            self.config.sweep_interval,
        )
        .spawn(Arc::new(self.broadcast.clone()))
    }

    /// Stops the sweeper and flushes every loaded workspace.
    pub async fn shutdown(&self, sweeper: SweeperHandle) {
        sweeper.shutdown().await;
        let flushed = self.documents.flush_all().await;
        info!(flushed, "workspace state flushed on shutdown");
    }
}
