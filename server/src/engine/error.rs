use std::fmt;

/// Kind of mirrored entity an error or notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Guild,
    Channel,
    Member,
    Emoji,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Guild => "guild",
            EntityKind::Channel => "channel",
            EntityKind::Member => "member",
            EntityKind::Emoji => "emoji",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by store mutations. Neither is fatal to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The referenced entity (usually the owning guild) is not in the store.
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    /// The payload lacks an identifier the operation needs.
    #[error("malformed event: {0}")]
    MalformedEvent(String),
}

impl StoreError {
    pub fn guild_not_found(id: &str) -> Self {
        StoreError::NotFound {
            kind: EntityKind::Guild,
            id: id.to_string(),
        }
    }
}

/// Outcome of a failed event application at the dispatcher boundary.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A panic was caught while applying the event.
    #[error("unexpected fault while handling {kind}: {message}")]
    UnexpectedFault { kind: String, message: String },
}
