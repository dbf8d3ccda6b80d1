use std::sync::Arc;

use sqlx::SqlitePool;

use crate::engine::store::GuildStore;

/// Shared state for the read-only HTTP API.
pub struct AppState {
    pub store: Arc<GuildStore>,
    pub db: SqlitePool,
}
