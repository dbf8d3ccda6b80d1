use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a JSON `null` as the type's default (remote payloads send
/// `null` for absent collections).
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// A mirrored guild with all of its nested collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Guild {
    pub id: String,
    pub name: String,
    pub icon: Option<String>,
    pub owner_id: String,
    pub region: String,
    pub afk_channel_id: Option<String>,
    pub embed_channel_id: Option<String>,
    pub splash: Option<String>,
    pub afk_timeout: i64,
    pub verification_level: u8,
    pub embed_enabled: bool,
    pub default_message_notifications: u8,
    #[serde(deserialize_with = "null_as_default")]
    pub channels: Vec<Channel>,
    #[serde(deserialize_with = "null_as_default")]
    pub members: Vec<Member>,
    #[serde(deserialize_with = "null_as_default")]
    pub emojis: Vec<Emoji>,
    #[serde(deserialize_with = "null_as_default")]
    pub voice_states: Vec<VoiceState>,
    #[serde(deserialize_with = "null_as_default")]
    pub roles: Vec<Role>,
}

impl Guild {
    pub fn channel(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    pub fn member(&self, user_id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.user.id == user_id)
    }

    pub fn emoji(&self, emoji_id: &str) -> Option<&Emoji> {
        self.emojis.iter().find(|e| e.id == emoji_id)
    }

    pub fn role(&self, role_id: &str) -> Option<&Role> {
        self.roles.iter().find(|r| r.id == role_id)
    }

    pub fn voice_state(&self, user_id: &str) -> Option<&VoiceState> {
        self.voice_states.iter().find(|v| v.user_id == user_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Channel {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    pub topic: Option<String>,
    #[serde(rename = "type")]
    pub kind: u8,
    pub nsfw: bool,
    pub position: i64,
    pub bitrate: u32,
    pub parent_id: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub permission_overwrites: Vec<PermissionOverwrite>,
}

/// Whether a channel overwrite targets a role or a single member.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverwriteKind {
    #[default]
    Role,
    Member,
}

/// A channel permission overwrite, keyed by its target id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PermissionOverwrite {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: OverwriteKind,
    pub allow: u64,
    pub deny: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub username: String,
    pub discriminator: String,
    pub avatar: Option<String>,
    pub bot: bool,
}

/// A guild member. Identified by `user.id` within its guild.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Member {
    pub guild_id: String,
    pub user: User,
    pub nick: Option<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub roles: Vec<String>,
    pub joined_at: Option<String>,
}

impl Member {
    pub fn user_id(&self) -> &str {
        &self.user.id
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Emoji {
    pub id: String,
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub roles: Vec<String>,
    pub animated: bool,
    pub managed: bool,
    pub require_colons: bool,
}

/// Voice-channel occupancy of one user. A missing `channel_id` means the
/// user left voice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceState {
    pub guild_id: String,
    pub channel_id: Option<String>,
    pub user_id: String,
    pub session_id: String,
    pub deaf: bool,
    pub mute: bool,
    pub self_deaf: bool,
    pub self_mute: bool,
    pub suppress: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Role {
    pub id: String,
    pub name: String,
    pub color: u32,
    pub hoist: bool,
    pub position: i64,
    pub permissions: u64,
    pub managed: bool,
    pub mentionable: bool,
}

/// Presence payload. Only the fields the mirror folds into members are kept.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Presence {
    pub guild_id: String,
    pub user: User,
    pub nick: Option<String>,
    pub roles: Option<Vec<String>>,
    pub status: String,
}
