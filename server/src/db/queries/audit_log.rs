use sqlx::SqlitePool;

use crate::db::models::{AuditLogRow, CreateAuditLogParams};

pub async fn create_entry(
    pool: &SqlitePool,
    params: &CreateAuditLogParams<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO audit_log (id, guild_id, action_type, target_type, target_id, changes) VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(params.id)
    .bind(params.guild_id)
    .bind(params.action_type)
    .bind(params.target_type)
    .bind(params.target_id)
    .bind(params.changes)
    .execute(pool)
    .await?;
    Ok(())
}

/// Newest entries first. `before` is an exclusive upper bound on `created_at`.
pub async fn list_entries(
    pool: &SqlitePool,
    guild_id: &str,
    action_type: Option<&str>,
    limit: i64,
    before: Option<&str>,
) -> Result<Vec<AuditLogRow>, sqlx::Error> {
    let mut sql = String::from("SELECT * FROM audit_log WHERE guild_id = ?");
    if action_type.is_some() {
        sql.push_str(" AND action_type = ?");
    }
    if before.is_some() {
        sql.push_str(" AND created_at < ?");
    }
    sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ?");

    let mut query = sqlx::query_as::<_, AuditLogRow>(&sql).bind(guild_id);
    if let Some(at) = action_type {
        query = query.bind(at);
    }
    if let Some(b) = before {
        query = query.bind(b);
    }
    query.bind(limit).fetch_all(pool).await
}
