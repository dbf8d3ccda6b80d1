use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;

use crate::db::models::AuditLogRow;
use crate::db::queries::audit_log;
use crate::engine::models::Guild;
use crate::engine::permissions::{channel_permissions, guild_permissions};

use super::app_state::AppState;

const DEFAULT_AUDIT_LIMIT: i64 = 50;
const MAX_AUDIT_LIMIT: i64 = 200;

// ── Guilds ──────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct GuildSummary {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    pub owner_id: String,
    pub member_count: usize,
    pub channel_count: usize,
}

impl From<&Guild> for GuildSummary {
    fn from(guild: &Guild) -> Self {
        Self {
            id: guild.id.clone(),
            name: guild.name.clone(),
            icon: guild.icon.clone(),
            owner_id: guild.owner_id.clone(),
            member_count: guild.members.len(),
            channel_count: guild.channels.len(),
        }
    }
}

/// GET /api/guilds: summaries of every mirrored guild.
pub async fn list_guilds(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let summaries: Vec<GuildSummary> = state
        .store
        .guilds()
        .iter()
        .map(|g| GuildSummary::from(g.as_ref()))
        .collect();
    Json(summaries)
}

/// GET /api/guilds/{id}: full snapshot.
pub async fn get_guild(
    State(state): State<Arc<AppState>>,
    Path(guild_id): Path<String>,
) -> impl IntoResponse {
    match state.store.snapshot_guild(&guild_id) {
        Some(guild) => Json(guild.as_ref()).into_response(),
        None => (StatusCode::NOT_FOUND, "Guild not found").into_response(),
    }
}

// ── Members ─────────────────────────────────────────────

pub async fn get_member(
    State(state): State<Arc<AppState>>,
    Path((guild_id, user_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let Some(guild) = state.store.snapshot_guild(&guild_id) else {
        return (StatusCode::NOT_FOUND, "Guild not found").into_response();
    };
    match guild.member(&user_id) {
        Some(member) => Json(member).into_response(),
        None => (StatusCode::NOT_FOUND, "Member not found").into_response(),
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct IsMemberResponse {
    pub is_member: bool,
}

/// GET /api/guilds/{id}/members/{user_id}/is. False for unknown guilds too.
pub async fn is_member(
    State(state): State<Arc<AppState>>,
    Path((guild_id, user_id)): Path<(String, String)>,
) -> impl IntoResponse {
    Json(IsMemberResponse {
        is_member: state.store.member(&guild_id, &user_id).is_some(),
    })
}

#[derive(Debug, Deserialize)]
pub struct PermissionsParams {
    pub channel_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PermissionsResponse {
    pub guild_id: String,
    pub user_id: String,
    pub channel_id: Option<String>,
    pub permissions: u64,
    pub names: Vec<String>,
}

/// GET /api/guilds/{id}/members/{user_id}/permissions[?channel_id=]
pub async fn get_member_permissions(
    State(state): State<Arc<AppState>>,
    Path((guild_id, user_id)): Path<(String, String)>,
    Query(params): Query<PermissionsParams>,
) -> impl IntoResponse {
    let Some(guild) = state.store.snapshot_guild(&guild_id) else {
        return (StatusCode::NOT_FOUND, "Guild not found").into_response();
    };
    let Some(member) = guild.member(&user_id) else {
        return (StatusCode::NOT_FOUND, "Member not found").into_response();
    };

    let perms = match params.channel_id.as_deref() {
        Some(channel_id) => match guild.channel(channel_id) {
            Some(channel) => channel_permissions(&guild, member, channel),
            None => return (StatusCode::NOT_FOUND, "Channel not found").into_response(),
        },
        None => guild_permissions(&guild, member),
    };

    Json(PermissionsResponse {
        guild_id,
        user_id,
        channel_id: params.channel_id,
        permissions: perms.bits(),
        names: perms.names().into_iter().map(String::from).collect(),
    })
    .into_response()
}

// ── Audit log ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct AuditLogParams {
    pub action_type: Option<String>,
    pub limit: Option<i64>,
    pub before: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub action_type: String,
    pub target_type: String,
    pub target_id: String,
    pub changes: Value,
    pub created_at: String,
}

impl From<AuditLogRow> for AuditLogEntry {
    fn from(row: AuditLogRow) -> Self {
        let changes = row
            .changes
            .as_deref()
            .and_then(|c| serde_json::from_str(c).ok())
            .unwrap_or(Value::Null);
        Self {
            id: row.id,
            action_type: row.action_type,
            target_type: row.target_type,
            target_id: row.target_id,
            changes,
            created_at: row.created_at,
        }
    }
}

/// Normalize an RFC 3339 timestamp to the UTC millisecond form stored in
/// `audit_log.created_at`, so the two compare correctly as strings.
fn normalize_timestamp(raw: &str) -> Option<String> {
    let parsed = DateTime::parse_from_rfc3339(raw).ok()?;
    Some(
        parsed
            .with_timezone(&Utc)
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string(),
    )
}

/// GET /api/guilds/{id}/audit-log: persisted history, newest first. Entries
/// outlive the guild itself, so unknown guilds simply return an empty list.
pub async fn get_audit_log(
    State(state): State<Arc<AppState>>,
    Path(guild_id): Path<String>,
    Query(params): Query<AuditLogParams>,
) -> impl IntoResponse {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);

    let before = match params.before.as_deref().map(normalize_timestamp) {
        None => None,
        Some(Some(ts)) => Some(ts),
        Some(None) => {
            return (
                StatusCode::BAD_REQUEST,
                "before must be an RFC 3339 timestamp",
            )
                .into_response();
        }
    };

    match audit_log::list_entries(
        &state.db,
        &guild_id,
        params.action_type.as_deref(),
        limit,
        before.as_deref(),
    )
    .await
    {
        Ok(rows) => {
            let entries: Vec<AuditLogEntry> = rows.into_iter().map(AuditLogEntry::from).collect();
            Json(entries).into_response()
        }
        Err(e) => {
            error!(error = %e, %guild_id, "Failed to fetch audit log");
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch audit log").into_response()
        }
    }
}
