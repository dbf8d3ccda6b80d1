use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::models::{Channel, Emoji, Guild, Member, Presence, Role, VoiceState};

/// Raw dispatch frame as it arrives from the transport: `{"t": kind, "d": payload}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub t: String,
    #[serde(default)]
    pub d: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MembersChunk {
    pub guild_id: String,
    pub members: Vec<Member>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmojisUpdate {
    pub guild_id: String,
    pub emojis: Vec<Emoji>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleUpdate {
    pub guild_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleDelete {
    pub guild_id: String,
    pub role_id: String,
}

/// Every event kind the mirror understands, decided once at the transport
/// boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    GuildCreate(Guild),
    GuildUpdate(Guild),
    GuildDelete(Guild),
    ChannelCreate(Channel),
    ChannelUpdate(Channel),
    ChannelDelete(Channel),
    GuildMemberAdd(Member),
    GuildMemberUpdate(Member),
    GuildMemberRemove(Member),
    GuildMembersChunk(MembersChunk),
    GuildEmojisUpdate(EmojisUpdate),
    PresenceUpdate(Presence),
    GuildRoleCreate(RoleUpdate),
    GuildRoleUpdate(RoleUpdate),
    GuildRoleDelete(RoleDelete),
    VoiceStateUpdate(VoiceState),
    /// A kind this mirror does not track; carries the raw kind name.
    Unknown(String),
}

impl GatewayEvent {
    /// Decode a frame. Unknown kinds succeed as [`GatewayEvent::Unknown`];
    /// a known kind with an undecodable payload is an error.
    pub fn from_envelope(envelope: Envelope) -> Result<Self, serde_json::Error> {
        use serde_json::from_value as decode;

        let Envelope { t, d } = envelope;
        let event = match t.as_str() {
            "GUILD_CREATE" => GatewayEvent::GuildCreate(decode(d)?),
            "GUILD_UPDATE" => GatewayEvent::GuildUpdate(decode(d)?),
            "GUILD_DELETE" => GatewayEvent::GuildDelete(decode(d)?),
            "CHANNEL_CREATE" => GatewayEvent::ChannelCreate(decode(d)?),
            "CHANNEL_UPDATE" => GatewayEvent::ChannelUpdate(decode(d)?),
            "CHANNEL_DELETE" => GatewayEvent::ChannelDelete(decode(d)?),
            "GUILD_MEMBER_ADD" => GatewayEvent::GuildMemberAdd(decode(d)?),
            "GUILD_MEMBER_UPDATE" => GatewayEvent::GuildMemberUpdate(decode(d)?),
            "GUILD_MEMBER_REMOVE" => GatewayEvent::GuildMemberRemove(decode(d)?),
            "GUILD_MEMBERS_CHUNK" => GatewayEvent::GuildMembersChunk(decode(d)?),
            "GUILD_EMOJIS_UPDATE" => GatewayEvent::GuildEmojisUpdate(decode(d)?),
            "PRESENCE_UPDATE" => GatewayEvent::PresenceUpdate(decode(d)?),
            "GUILD_ROLE_CREATE" => GatewayEvent::GuildRoleCreate(decode(d)?),
            "GUILD_ROLE_UPDATE" => GatewayEvent::GuildRoleUpdate(decode(d)?),
            "GUILD_ROLE_DELETE" => GatewayEvent::GuildRoleDelete(decode(d)?),
            "VOICE_STATE_UPDATE" => GatewayEvent::VoiceStateUpdate(decode(d)?),
            _ => GatewayEvent::Unknown(t),
        };
        Ok(event)
    }

    /// Parse one newline-delimited JSON frame.
    pub fn parse_line(line: &str) -> Result<Self, serde_json::Error> {
        Self::from_envelope(serde_json::from_str(line)?)
    }

    /// Wire name of the event kind.
    pub fn kind(&self) -> &str {
        match self {
            GatewayEvent::GuildCreate(_) => "GUILD_CREATE",
            GatewayEvent::GuildUpdate(_) => "GUILD_UPDATE",
            GatewayEvent::GuildDelete(_) => "GUILD_DELETE",
            GatewayEvent::ChannelCreate(_) => "CHANNEL_CREATE",
            GatewayEvent::ChannelUpdate(_) => "CHANNEL_UPDATE",
            GatewayEvent::ChannelDelete(_) => "CHANNEL_DELETE",
            GatewayEvent::GuildMemberAdd(_) => "GUILD_MEMBER_ADD",
            GatewayEvent::GuildMemberUpdate(_) => "GUILD_MEMBER_UPDATE",
            GatewayEvent::GuildMemberRemove(_) => "GUILD_MEMBER_REMOVE",
            GatewayEvent::GuildMembersChunk(_) => "GUILD_MEMBERS_CHUNK",
            GatewayEvent::GuildEmojisUpdate(_) => "GUILD_EMOJIS_UPDATE",
            GatewayEvent::PresenceUpdate(_) => "PRESENCE_UPDATE",
            GatewayEvent::GuildRoleCreate(_) => "GUILD_ROLE_CREATE",
            GatewayEvent::GuildRoleUpdate(_) => "GUILD_ROLE_UPDATE",
            GatewayEvent::GuildRoleDelete(_) => "GUILD_ROLE_DELETE",
            GatewayEvent::VoiceStateUpdate(_) => "VOICE_STATE_UPDATE",
            GatewayEvent::Unknown(kind) => kind,
        }
    }

    /// Guild the event applies to, when the payload names one.
    pub fn guild_id(&self) -> Option<&str> {
        let id = match self {
            GatewayEvent::GuildCreate(g)
            | GatewayEvent::GuildUpdate(g)
            | GatewayEvent::GuildDelete(g) => &g.id,
            GatewayEvent::ChannelCreate(c)
            | GatewayEvent::ChannelUpdate(c)
            | GatewayEvent::ChannelDelete(c) => &c.guild_id,
            GatewayEvent::GuildMemberAdd(m)
            | GatewayEvent::GuildMemberUpdate(m)
            | GatewayEvent::GuildMemberRemove(m) => &m.guild_id,
            GatewayEvent::GuildMembersChunk(chunk) => &chunk.guild_id,
            GatewayEvent::GuildEmojisUpdate(update) => &update.guild_id,
            GatewayEvent::PresenceUpdate(p) => &p.guild_id,
            GatewayEvent::GuildRoleCreate(r) | GatewayEvent::GuildRoleUpdate(r) => &r.guild_id,
            GatewayEvent::GuildRoleDelete(r) => &r.guild_id,
            GatewayEvent::VoiceStateUpdate(v) => &v.guild_id,
            GatewayEvent::Unknown(_) => return None,
        };
        (!id.is_empty()).then_some(id.as_str())
    }
}
