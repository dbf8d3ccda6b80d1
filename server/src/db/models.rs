use serde::{Deserialize, Serialize};

/// A persisted change notification.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogRow {
    pub id: String,
    pub guild_id: String,
    pub action_type: String,
    pub target_type: String,
    pub target_id: String,
    pub changes: Option<String>,
    pub created_at: String,
}

/// Parameters for creating an audit log entry.
pub struct CreateAuditLogParams<'a> {
    pub id: &'a str,
    pub guild_id: &'a str,
    pub action_type: &'a str,
    pub target_type: &'a str,
    pub target_id: &'a str,
    pub changes: Option<&'a str>,
}
