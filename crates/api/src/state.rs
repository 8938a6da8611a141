//! Application state

use std::sync::Arc;

use sqlx::PgPool;
use tessera_collections::CollectionsService;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Config,
    pub collections: Arc<CollectionsService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: Config) -> anyhow::Result<Self> {
        let collections = CollectionsService::from_env(pool.clone())
            .map_err(|e| anyhow::anyhow!("failed to initialize recovery engine: {e}"))?;
        tracing::info!("Recovery engine initialized");

        Ok(Self {
            pool,
            config,
            collections: Arc::new(collections),
        })
    }
}
