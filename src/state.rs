use std::sync::Arc;

use diesel::{
    pg::PgConnection,
    r2d2::{ConnectionManager, PooledConnection},
};

use crate::{
    auth::jwt::JwtService,
    config::AppConfig,
    db::PgPool,
    error::{AppError, AppResult},
    processor::{ContentGenerator, DocumentProcessor},
    realtime::ChangeFeed,
    storage::ObjectStorage,
};

type PgPooledConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// All collaborators are constructed at startup and injected here; nothing
/// in the crate reaches for ambient singletons.
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn ObjectStorage>,
    pub processor: Arc<dyn DocumentProcessor>,
    pub generator: Arc<dyn ContentGenerator>,
    pub changes: ChangeFeed,
    pub jwt: JwtService,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        config: AppConfig,
        storage: Arc<dyn ObjectStorage>,
        processor: Arc<dyn DocumentProcessor>,
        generator: Arc<dyn ContentGenerator>,
        changes: ChangeFeed,
        jwt: JwtService,
    ) -> Self {
        Self {
            pool,
            config: Arc::new(config),
            storage,
            processor,
            generator,
            changes,
            jwt,
        }
    }

    pub fn db(&self) -> AppResult<PgPooledConnection> {
        self.pool
            .get()
            .map_err(|err| AppError::internal(format!("database pool error: {err}")))
    }
}
