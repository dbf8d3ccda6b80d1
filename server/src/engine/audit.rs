use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use super::diff::FieldChange;
use super::error::EntityKind;
use super::models::Emoji;
use crate::db::models::CreateAuditLogParams;

/// A semantic change detected while applying an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AuditEvent {
    GuildUpdated {
        guild_id: String,
        changes: Vec<FieldChange>,
    },
    ChannelUpdated {
        guild_id: String,
        channel_id: String,
        changes: Vec<FieldChange>,
    },
    MemberUpdated {
        guild_id: String,
        user_id: String,
        added_roles: Vec<String>,
        removed_roles: Vec<String>,
        changes: Vec<FieldChange>,
    },
    EmojiCreated {
        guild_id: String,
        emoji: Emoji,
    },
    EmojiUpdated {
        guild_id: String,
        emoji_id: String,
        changes: Vec<FieldChange>,
    },
    EmojiDeleted {
        guild_id: String,
        emoji: Emoji,
    },
}

impl AuditEvent {
    pub fn guild_id(&self) -> &str {
        match self {
            AuditEvent::GuildUpdated { guild_id, .. }
            | AuditEvent::ChannelUpdated { guild_id, .. }
            | AuditEvent::MemberUpdated { guild_id, .. }
            | AuditEvent::EmojiCreated { guild_id, .. }
            | AuditEvent::EmojiUpdated { guild_id, .. }
            | AuditEvent::EmojiDeleted { guild_id, .. } => guild_id,
        }
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            AuditEvent::GuildUpdated { .. } => EntityKind::Guild,
            AuditEvent::ChannelUpdated { .. } => EntityKind::Channel,
            AuditEvent::MemberUpdated { .. } => EntityKind::Member,
            AuditEvent::EmojiCreated { .. }
            | AuditEvent::EmojiUpdated { .. }
            | AuditEvent::EmojiDeleted { .. } => EntityKind::Emoji,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            AuditEvent::GuildUpdated { guild_id, .. } => guild_id,
            AuditEvent::ChannelUpdated { channel_id, .. } => channel_id,
            AuditEvent::MemberUpdated { user_id, .. } => user_id,
            AuditEvent::EmojiUpdated { emoji_id, .. } => emoji_id,
            AuditEvent::EmojiCreated { emoji, .. } | AuditEvent::EmojiDeleted { emoji, .. } => {
                &emoji.id
            }
        }
    }

    pub fn action_type(&self) -> &'static str {
        match self {
            AuditEvent::GuildUpdated { .. } => "guild_update",
            AuditEvent::ChannelUpdated { .. } => "channel_update",
            AuditEvent::MemberUpdated { .. } => "member_update",
            AuditEvent::EmojiCreated { .. } => "emoji_create",
            AuditEvent::EmojiUpdated { .. } => "emoji_update",
            AuditEvent::EmojiDeleted { .. } => "emoji_delete",
        }
    }

    /// The `changes` column payload: `{field: {old, new}}` for updates, the
    /// emoji itself for creations and deletions.
    pub fn changes_json(&self) -> Value {
        fn fields(changes: &[FieldChange]) -> serde_json::Map<String, Value> {
            changes
                .iter()
                .map(|c| {
                    (
                        c.field.to_string(),
                        serde_json::json!({ "old": c.old, "new": c.new }),
                    )
                })
                .collect()
        }

        match self {
            AuditEvent::GuildUpdated { changes, .. }
            | AuditEvent::ChannelUpdated { changes, .. }
            | AuditEvent::EmojiUpdated { changes, .. } => Value::Object(fields(changes)),
            AuditEvent::MemberUpdated {
                added_roles,
                removed_roles,
                changes,
                ..
            } => {
                let mut map = fields(changes);
                if !added_roles.is_empty() || !removed_roles.is_empty() {
                    map.insert(
                        "roles".into(),
                        serde_json::json!({ "added": added_roles, "removed": removed_roles }),
                    );
                }
                Value::Object(map)
            }
            AuditEvent::EmojiCreated { emoji, .. } | AuditEvent::EmojiDeleted { emoji, .. } => {
                serde_json::to_value(emoji).unwrap_or(Value::Null)
            }
        }
    }
}

/// Receiver of change notifications. Implementations must not block.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Discards every notification.
#[derive(Debug, Default)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Forwards notifications to a bounded queue. A full queue drops the
/// notification rather than stalling the writer.
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::Sender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn emit(&self, event: AuditEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    guild_id = %event.guild_id(),
                    action = event.action_type(),
                    "audit queue full, dropping notification"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("audit queue closed, dropping notification");
            }
        }
    }
}

/// Persist a single notification as an audit log row.
pub async fn persist_event(pool: &SqlitePool, event: &AuditEvent) -> Result<(), sqlx::Error> {
    let id = Uuid::new_v4().to_string();
    let changes = event.changes_json().to_string();
    crate::db::queries::audit_log::create_entry(
        pool,
        &CreateAuditLogParams {
            id: &id,
            guild_id: event.guild_id(),
            action_type: event.action_type(),
            target_type: event.entity_kind().as_str(),
            target_id: event.entity_id(),
            changes: Some(&changes),
        },
    )
    .await
}

/// Drain the audit queue into the database until every sender is dropped.
pub fn spawn_audit_writer(pool: SqlitePool, mut rx: mpsc::Receiver<AuditEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(e) = persist_event(&pool, &event).await {
                error!(
                    error = %e,
                    guild_id = %event.guild_id(),
                    action = event.action_type(),
                    "failed to persist audit entry"
                );
            }
        }
        debug!("audit writer stopped");
    })
}

/// Collects notifications in memory for assertions.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

#[cfg(test)]
impl RecordingAuditSink {
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<AuditEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

#[cfg(test)]
impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        self.events.lock().unwrap().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::pool::{create_pool, run_migrations};
    use crate::db::queries::audit_log;
    use serde_json::json;

    fn emoji(id: &str, name: &str) -> Emoji {
        Emoji {
            id: id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    fn member_update() -> AuditEvent {
        AuditEvent::MemberUpdated {
            guild_id: "g1".into(),
            user_id: "u1".into(),
            added_roles: vec!["4".into()],
            removed_roles: vec!["1".into()],
            changes: vec![FieldChange {
                field: "nick",
                old: json!("old"),
                new: json!("new"),
            }],
        }
    }

    #[test]
    fn test_accessors() {
        let event = AuditEvent::EmojiDeleted {
            guild_id: "g1".into(),
            emoji: emoji("e1", "wave"),
        };
        assert_eq!(event.guild_id(), "g1");
        assert_eq!(event.entity_kind(), EntityKind::Emoji);
        assert_eq!(event.entity_id(), "e1");
        assert_eq!(event.action_type(), "emoji_delete");
    }

    #[test]
    fn test_member_changes_json() {
        let value = member_update().changes_json();
        assert_eq!(value["nick"]["old"], "old");
        assert_eq!(value["nick"]["new"], "new");
        assert_eq!(value["roles"]["added"], json!(["4"]));
        assert_eq!(value["roles"]["removed"], json!(["1"]));
    }

    #[test]
    fn test_member_changes_json_without_roles() {
        let event = AuditEvent::MemberUpdated {
            guild_id: "g1".into(),
            user_id: "u1".into(),
            added_roles: vec![],
            removed_roles: vec![],
            changes: vec![],
        };
        assert_eq!(event.changes_json(), json!({}));
    }

    #[test]
    fn test_serialized_tag() {
        let value = serde_json::to_value(member_update()).unwrap();
        assert_eq!(value["action"], "member_updated");
        assert_eq!(value["user_id"], "u1");
    }

    #[tokio::test]
    async fn test_channel_sink_drops_when_full() {
        let (sink, mut rx) = ChannelAuditSink::new(1);
        sink.emit(member_update());
        sink.emit(member_update());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_channel_sink_closed_is_silent() {
        let (sink, rx) = ChannelAuditSink::new(4);
        drop(rx);
        sink.emit(member_update());
    }

    #[tokio::test]
    async fn test_writer_persists_events() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();

        let (sink, rx) = ChannelAuditSink::new(8);
        let handle = spawn_audit_writer(pool.clone(), rx);
        sink.emit(member_update());
        sink.emit(AuditEvent::EmojiCreated {
            guild_id: "g1".into(),
            emoji: emoji("e1", "wave"),
        });
        drop(sink);
        handle.await.unwrap();

        let rows = audit_log::list_entries(&pool, "g1", None, 50, None)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        let member_row = rows
            .iter()
            .find(|r| r.action_type == "member_update")
            .unwrap();
        assert_eq!(member_row.target_type, "member");
        assert_eq!(member_row.target_id, "u1");
        let changes: Value = serde_json::from_str(member_row.changes.as_deref().unwrap()).unwrap();
        assert_eq!(changes["roles"]["added"], json!(["4"]));
    }
}
