use bitflags::bitflags;

use super::models::{Channel, Guild, Member, OverwriteKind, PermissionOverwrite};

bitflags! {
    /// Permission bitfield as carried by roles and channel overwrites.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Permissions: u64 {
        // ── General ──
        const CREATE_INSTANT_INVITE = 1 << 0;
        const KICK_MEMBERS          = 1 << 1;
        const BAN_MEMBERS           = 1 << 2;
        const ADMINISTRATOR         = 1 << 3;
        const MANAGE_CHANNELS       = 1 << 4;
        const MANAGE_GUILD          = 1 << 5;
        const ADD_REACTIONS         = 1 << 6;
        const VIEW_AUDIT_LOG        = 1 << 7;

        // ── Text ──
        const VIEW_CHANNEL          = 1 << 10;
        const SEND_MESSAGES         = 1 << 11;
        const SEND_TTS_MESSAGES     = 1 << 12;
        const MANAGE_MESSAGES       = 1 << 13;
        const EMBED_LINKS           = 1 << 14;
        const ATTACH_FILES          = 1 << 15;
        const READ_MESSAGE_HISTORY  = 1 << 16;
        const MENTION_EVERYONE      = 1 << 17;
        const USE_EXTERNAL_EMOJIS   = 1 << 18;

        // ── Voice ──
        const CONNECT               = 1 << 20;
        const SPEAK                 = 1 << 21;
        const MUTE_MEMBERS          = 1 << 22;
        const DEAFEN_MEMBERS        = 1 << 23;
        const MOVE_MEMBERS          = 1 << 24;
        const USE_VAD               = 1 << 25;

        // ── Management ──
        const CHANGE_NICKNAME       = 1 << 26;
        const MANAGE_NICKNAMES      = 1 << 27;
        const MANAGE_ROLES          = 1 << 28;
        const MANAGE_WEBHOOKS       = 1 << 29;
        const MANAGE_EMOJIS         = 1 << 30;
    }
}

impl Permissions {
    /// Names of the set flags, in bit order.
    pub fn names(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// The `@everyone` role shares the guild's id.
fn is_everyone_role(guild: &Guild, role_id: &str) -> bool {
    role_id == guild.id
}

/// Base guild-level permissions for a member.
///
/// The owner gets everything. Otherwise the `@everyone` role is OR-ed with
/// every role the member holds, and ADMINISTRATOR short-circuits to all.
/// Role ids that no longer exist in the guild are ignored.
pub fn guild_permissions(guild: &Guild, member: &Member) -> Permissions {
    if !guild.owner_id.is_empty() && guild.owner_id == member.user.id {
        return Permissions::all();
    }

    let mut perms = guild
        .roles
        .iter()
        .filter(|r| is_everyone_role(guild, &r.id) || r.name == "@everyone")
        .fold(Permissions::empty(), |acc, r| {
            acc | Permissions::from_bits_truncate(r.permissions)
        });

    for role_id in &member.roles {
        if let Some(role) = guild.role(role_id) {
            perms |= Permissions::from_bits_truncate(role.permissions);
        }
    }

    if perms.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }
    perms
}

/// Effective permissions in a channel.
///
/// Overwrites apply in three layers: the `@everyone` overwrite, then the
/// union of the member's role overwrites (denies before allows), then the
/// member-specific overwrite.
pub fn channel_permissions(guild: &Guild, member: &Member, channel: &Channel) -> Permissions {
    let mut perms = guild_permissions(guild, member);
    if perms.contains(Permissions::ADMINISTRATOR) {
        return Permissions::all();
    }

    let overwrites = &channel.permission_overwrites;
    if overwrites.is_empty() {
        return perms;
    }

    let allow = |ov: &PermissionOverwrite| Permissions::from_bits_truncate(ov.allow);
    let deny = |ov: &PermissionOverwrite| Permissions::from_bits_truncate(ov.deny);

    for ov in overwrites {
        if ov.kind == OverwriteKind::Role && is_everyone_role(guild, &ov.id) {
            perms &= !deny(ov);
            perms |= allow(ov);
        }
    }

    let mut role_allow = Permissions::empty();
    let mut role_deny = Permissions::empty();
    for ov in overwrites {
        if ov.kind == OverwriteKind::Role
            && !is_everyone_role(guild, &ov.id)
            && member.roles.iter().any(|r| *r == ov.id)
        {
            role_allow |= allow(ov);
            role_deny |= deny(ov);
        }
    }
    perms &= !role_deny;
    perms |= role_allow;

    for ov in overwrites {
        if ov.kind == OverwriteKind::Member && ov.id == member.user.id {
            perms &= !deny(ov);
            perms |= allow(ov);
        }
    }

    perms
}
