use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use super::app_state::AppState;
use super::rest_api;

/// Build the axum router for the read model.
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/guilds", axum::routing::get(rest_api::list_guilds))
        .route("/api/guilds/{id}", axum::routing::get(rest_api::get_guild))
        .route(
            "/api/guilds/{id}/members/{user_id}",
            axum::routing::get(rest_api::get_member),
        )
        .route(
            "/api/guilds/{id}/members/{user_id}/is",
            axum::routing::get(rest_api::is_member),
        )
        .route(
            "/api/guilds/{id}/members/{user_id}/permissions",
            axum::routing::get(rest_api::get_member_permissions),
        )
        .route(
            "/api/guilds/{id}/audit-log",
            axum::routing::get(rest_api::get_audit_log),
        )
        .layer(cors)
        .with_state(state)
}
