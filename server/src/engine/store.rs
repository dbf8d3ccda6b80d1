use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::json;
use tracing::debug;

use super::audit::{AuditEvent, AuditSink};
use super::diff::{Field, field_diff, set_diff};
use super::error::StoreError;
use super::models::{
    Channel, Emoji, Guild, Member, PermissionOverwrite, Presence, Role, VoiceState,
};

const GUILD_FIELDS: &[Field<Guild>] = &[
    ("name", |g: &Guild| json!(g.name)),
    ("icon", |g: &Guild| json!(g.icon)),
    ("region", |g: &Guild| json!(g.region)),
    ("afk_channel_id", |g: &Guild| json!(g.afk_channel_id)),
    ("embed_channel_id", |g: &Guild| json!(g.embed_channel_id)),
    ("owner_id", |g: &Guild| json!(g.owner_id)),
    ("splash", |g: &Guild| json!(g.splash)),
    ("afk_timeout", |g: &Guild| json!(g.afk_timeout)),
    ("verification_level", |g: &Guild| json!(g.verification_level)),
    ("embed_enabled", |g: &Guild| json!(g.embed_enabled)),
    ("default_message_notifications", |g: &Guild| {
        json!(g.default_message_notifications)
    }),
];

const CHANNEL_FIELDS: &[Field<Channel>] = &[
    ("name", |c: &Channel| json!(c.name)),
    ("topic", |c: &Channel| json!(c.topic)),
    ("nsfw", |c: &Channel| json!(c.nsfw)),
    ("position", |c: &Channel| json!(c.position)),
    ("bitrate", |c: &Channel| json!(c.bitrate)),
    ("parent_id", |c: &Channel| json!(c.parent_id)),
    ("permission_overwrites", |c: &Channel| {
        overwrite_set(&c.permission_overwrites)
    }),
];

const MEMBER_FIELDS: &[Field<Member>] = &[
    ("username", |m: &Member| json!(m.user.username)),
    ("nick", |m: &Member| json!(m.nick)),
    ("discriminator", |m: &Member| json!(m.user.discriminator)),
];

const EMOJI_FIELDS: &[Field<Emoji>] = &[
    ("name", |e: &Emoji| json!(e.name)),
    ("animated", |e: &Emoji| json!(e.animated)),
    ("managed", |e: &Emoji| json!(e.managed)),
    ("require_colons", |e: &Emoji| json!(e.require_colons)),
];

/// Overwrites compared as an unordered set of (target, allow, deny).
fn overwrite_set(overwrites: &[PermissionOverwrite]) -> serde_json::Value {
    let mut entries: Vec<(&str, u64, u64)> = overwrites
        .iter()
        .map(|o| (o.id.as_str(), o.allow, o.deny))
        .collect();
    entries.sort_unstable();
    entries.dedup();
    json!(entries)
}

/// Keep the last occurrence of every key, preserving relative order.
fn dedup_by_key<T, K, F>(items: &mut Vec<T>, key: F)
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    let mut kept: Vec<T> = items.drain(..).rev().filter(|item| seen.insert(key(item))).collect();
    kept.reverse();
    *items = kept;
}

/// Stamp the owning guild onto nested records and enforce id uniqueness.
fn normalize(guild: &mut Guild) {
    let guild_id = guild.id.clone();
    for channel in &mut guild.channels {
        channel.guild_id.clone_from(&guild_id);
    }
    for member in &mut guild.members {
        member.guild_id.clone_from(&guild_id);
    }
    for voice_state in &mut guild.voice_states {
        voice_state.guild_id.clone_from(&guild_id);
    }
    dedup_by_key(&mut guild.channels, |c| c.id.clone());
    dedup_by_key(&mut guild.members, |m| m.user.id.clone());
    dedup_by_key(&mut guild.emojis, |e| e.id.clone());
    dedup_by_key(&mut guild.roles, |r| r.id.clone());
    dedup_by_key(&mut guild.voice_states, |v| v.user_id.clone());
}

fn require(value: &str, what: &str) -> Result<(), StoreError> {
    if value.is_empty() {
        return Err(StoreError::MalformedEvent(format!("missing {what}")));
    }
    Ok(())
}

/// Replace or append `member`, noting role and scalar changes.
fn merge_member(guild: &mut Guild, member: &Member, notes: &mut Vec<AuditEvent>) {
    match guild
        .members
        .iter_mut()
        .find(|m| m.user.id == member.user.id)
    {
        Some(existing) => {
            let roles = set_diff(&existing.roles, &member.roles);
            let changes = field_diff(&*existing, member, MEMBER_FIELDS);
            if !roles.is_empty() || !changes.is_empty() {
                notes.push(AuditEvent::MemberUpdated {
                    guild_id: member.guild_id.clone(),
                    user_id: member.user.id.clone(),
                    added_roles: roles.added.into_iter().collect(),
                    removed_roles: roles.removed.into_iter().collect(),
                    changes,
                });
            }
            *existing = member.clone();
        }
        None => guild.members.push(member.clone()),
    }
}

/// Only the fields a presence actually carries replace the stored ones.
fn overlay_presence(existing: Option<Member>, presence: &Presence) -> Member {
    let Some(mut member) = existing else {
        return Member {
            guild_id: presence.guild_id.clone(),
            user: presence.user.clone(),
            nick: presence.nick.clone(),
            roles: presence.roles.clone().unwrap_or_default(),
            joined_at: None,
        };
    };

    member.guild_id.clone_from(&presence.guild_id);
    if let Some(nick) = presence.nick.as_ref().filter(|n| !n.is_empty()) {
        member.nick = Some(nick.clone());
    }
    if !presence.user.username.is_empty() {
        member.user.username.clone_from(&presence.user.username);
    }
    if !presence.user.discriminator.is_empty() {
        member.user.discriminator.clone_from(&presence.user.discriminator);
    }
    if presence.user.avatar.is_some() {
        member.user.avatar.clone_from(&presence.user.avatar);
    }
    if let Some(roles) = &presence.roles {
        member.roles.clone_from(roles);
    }
    member
}

#[derive(Debug, Clone)]
enum GuildEntry {
    Available(Arc<Guild>),
    /// The guild was removed; kept so "removed" is distinct from "never seen".
    Removed,
}

/// In-memory mirror of every guild the process can see.
///
/// Every published guild is immutable: a mutation builds a private copy,
/// applies the event to it, and swaps it in with a single map insert while
/// holding the write lock. Readers clone the `Arc` under the read lock and
/// keep a consistent snapshot for as long as they like. Change notifications
/// are collected during the mutation and handed to the audit sink after the
/// lock is released.
pub struct GuildStore {
    guilds: RwLock<HashMap<String, GuildEntry>>,
    sink: Arc<dyn AuditSink>,
}

impl GuildStore {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            guilds: RwLock::new(HashMap::new()),
            sink,
        }
    }

    // A panic can only happen before the swap, so a poisoned map is still whole.
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, GuildEntry>> {
        self.guilds.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, GuildEntry>> {
        self.guilds.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, notes: Vec<AuditEvent>) {
        for note in notes {
            self.sink.emit(note);
        }
    }

    /// Apply `apply` to a copy of an available guild and publish the result.
    fn mutate_guild<F>(&self, guild_id: &str, apply: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Guild, &mut Vec<AuditEvent>),
    {
        let mut notes = Vec::new();
        {
            let mut guilds = self.write();
            let Some(GuildEntry::Available(current)) = guilds.get(guild_id) else {
                return Err(StoreError::guild_not_found(guild_id));
            };
            let mut next = Guild::clone(current);
            apply(&mut next, &mut notes);
            guilds.insert(guild_id.to_string(), GuildEntry::Available(Arc::new(next)));
        }
        self.publish(notes);
        Ok(())
    }

    // ── Guilds ──────────────────────────────────────────────────────

    /// Insert a guild, or overwrite it and report scalar changes.
    pub fn upsert_guild(&self, guild: &Guild) -> Result<(), StoreError> {
        require(&guild.id, "guild id")?;

        let mut next = guild.clone();
        normalize(&mut next);

        let mut notes = Vec::new();
        {
            let mut guilds = self.write();
            if let Some(GuildEntry::Available(current)) = guilds.get(&guild.id) {
                let changes = field_diff(current.as_ref(), &next, GUILD_FIELDS);
                if !changes.is_empty() {
                    notes.push(AuditEvent::GuildUpdated {
                        guild_id: guild.id.clone(),
                        changes,
                    });
                }
            }
            guilds.insert(guild.id.clone(), GuildEntry::Available(Arc::new(next)));
        }

        debug!(guild_id = %guild.id, "guild upserted");
        self.publish(notes);
        Ok(())
    }

    /// Mark a guild as removed. Unknown or already removed guilds are fine.
    pub fn remove_guild(&self, guild_id: &str) -> Result<(), StoreError> {
        require(guild_id, "guild id")?;
        self.write().insert(guild_id.to_string(), GuildEntry::Removed);
        debug!(%guild_id, "guild removed");
        Ok(())
    }

    // ── Channels ────────────────────────────────────────────────────

    pub fn upsert_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        require(&channel.guild_id, "channel guild_id")?;
        require(&channel.id, "channel id")?;

        self.mutate_guild(&channel.guild_id, |guild, notes| {
            match guild.channels.iter_mut().find(|c| c.id == channel.id) {
                Some(existing) => {
                    let changes = field_diff(&*existing, channel, CHANNEL_FIELDS);
                    if !changes.is_empty() {
                        notes.push(AuditEvent::ChannelUpdated {
                            guild_id: channel.guild_id.clone(),
                            channel_id: channel.id.clone(),
                            changes,
                        });
                    }
                    *existing = channel.clone();
                }
                None => guild.channels.push(channel.clone()),
            }
        })
    }

    pub fn remove_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        require(&channel.guild_id, "channel guild_id")?;
        require(&channel.id, "channel id")?;

        self.mutate_guild(&channel.guild_id, |guild, _| {
            guild.channels.retain(|c| c.id != channel.id);
        })
    }

    // ── Members ─────────────────────────────────────────────────────

    /// Insert or replace a member. The stored copy is always refreshed, even
    /// when nothing audit-worthy changed.
    pub fn upsert_member(&self, member: &Member) -> Result<(), StoreError> {
        require(&member.guild_id, "member guild_id")?;
        require(member.user_id(), "member user id")?;

        self.mutate_guild(&member.guild_id, |guild, notes| {
            merge_member(guild, member, notes);
        })
    }

    /// Upsert a batch of members as one change. Every member is validated
    /// before anything is applied, so a bad entry rejects the whole batch.
    pub fn upsert_members(&self, guild_id: &str, members: &[Member]) -> Result<(), StoreError> {
        require(guild_id, "guild id")?;
        for member in members {
            require(member.user_id(), "member user id")?;
            if member.guild_id != guild_id {
                return Err(StoreError::MalformedEvent(format!(
                    "member {} belongs to guild {:?}, not {guild_id}",
                    member.user_id(),
                    member.guild_id
                )));
            }
        }

        self.mutate_guild(guild_id, |guild, notes| {
            for member in members {
                merge_member(guild, member, notes);
            }
        })
    }

    /// Fold a presence update into the member it describes, or create a
    /// minimal member when none is stored yet.
    pub fn apply_presence(&self, presence: &Presence) -> Result<(), StoreError> {
        require(&presence.guild_id, "presence guild_id")?;
        require(&presence.user.id, "presence user id")?;

        self.mutate_guild(&presence.guild_id, |guild, notes| {
            let existing = guild.member(&presence.user.id).cloned();
            let member = overlay_presence(existing, presence);
            merge_member(guild, &member, notes);
        })
    }

    pub fn remove_member(&self, member: &Member) -> Result<(), StoreError> {
        require(&member.guild_id, "member guild_id")?;
        require(member.user_id(), "member user id")?;

        self.mutate_guild(&member.guild_id, |guild, _| {
            guild.members.retain(|m| m.user.id != member.user.id);
        })
    }

    // ── Emoji ───────────────────────────────────────────────────────

    /// Reconcile the guild's emoji against the complete list the remote
    /// side now reports.
    pub fn upsert_emoji_set(&self, guild_id: &str, emojis: &[Emoji]) -> Result<(), StoreError> {
        require(guild_id, "guild id")?;
        if emojis.iter().any(|e| e.id.is_empty()) {
            return Err(StoreError::MalformedEvent("emoji without id".into()));
        }

        let mut incoming = emojis.to_vec();
        dedup_by_key(&mut incoming, |e| e.id.clone());

        self.mutate_guild(guild_id, |guild, notes| {
            let by_id: HashMap<&str, &Emoji> =
                incoming.iter().map(|e| (e.id.as_str(), e)).collect();

            let mut next = Vec::with_capacity(incoming.len());
            for old in std::mem::take(&mut guild.emojis) {
                match by_id.get(old.id.as_str()) {
                    None => notes.push(AuditEvent::EmojiDeleted {
                        guild_id: guild_id.to_string(),
                        emoji: old,
                    }),
                    Some(new) => {
                        let changes = field_diff(&old, *new, EMOJI_FIELDS);
                        if !changes.is_empty() {
                            notes.push(AuditEvent::EmojiUpdated {
                                guild_id: guild_id.to_string(),
                                emoji_id: old.id.clone(),
                                changes,
                            });
                        }
                        next.push((*new).clone());
                    }
                }
            }

            let kept: HashSet<String> = next.iter().map(|e: &Emoji| e.id.clone()).collect();
            for new in &incoming {
                if !kept.contains(&new.id) {
                    notes.push(AuditEvent::EmojiCreated {
                        guild_id: guild_id.to_string(),
                        emoji: new.clone(),
                    });
                    next.push(new.clone());
                }
            }

            guild.emojis = next;
        })
    }

    // ── Roles ───────────────────────────────────────────────────────

    pub fn upsert_role(&self, guild_id: &str, role: &Role) -> Result<(), StoreError> {
        require(guild_id, "guild id")?;
        require(&role.id, "role id")?;

        self.mutate_guild(guild_id, |guild, _| {
            match guild.roles.iter_mut().find(|r| r.id == role.id) {
                Some(existing) => *existing = role.clone(),
                None => guild.roles.push(role.clone()),
            }
        })
    }

    pub fn remove_role(&self, guild_id: &str, role_id: &str) -> Result<(), StoreError> {
        require(guild_id, "guild id")?;
        require(role_id, "role id")?;

        self.mutate_guild(guild_id, |guild, _| {
            guild.roles.retain(|r| r.id != role_id);
        })
    }

    // ── Voice ───────────────────────────────────────────────────────

    /// Track voice occupancy. A state without a channel removes the user.
    pub fn update_voice_state(&self, state: &VoiceState) -> Result<(), StoreError> {
        require(&state.guild_id, "voice state guild_id")?;
        require(&state.user_id, "voice state user id")?;

        let left = state.channel_id.as_deref().is_none_or(str::is_empty);
        self.mutate_guild(&state.guild_id, |guild, _| {
            if left {
                guild.voice_states.retain(|v| v.user_id != state.user_id);
                return;
            }
            match guild
                .voice_states
                .iter_mut()
                .find(|v| v.user_id == state.user_id)
            {
                Some(existing) => *existing = state.clone(),
                None => guild.voice_states.push(state.clone()),
            }
        })
    }

    // ── Reads ───────────────────────────────────────────────────────

    /// Immutable snapshot of a guild, or `None` when unknown or removed.
    pub fn snapshot_guild(&self, guild_id: &str) -> Option<Arc<Guild>> {
        match self.read().get(guild_id) {
            Some(GuildEntry::Available(guild)) => Some(Arc::clone(guild)),
            _ => None,
        }
    }

    /// Snapshots of every available guild, ordered by id.
    pub fn guilds(&self) -> Vec<Arc<Guild>> {
        let mut guilds: Vec<Arc<Guild>> = self
            .read()
            .values()
            .filter_map(|entry| match entry {
                GuildEntry::Available(guild) => Some(Arc::clone(guild)),
                GuildEntry::Removed => None,
            })
            .collect();
        guilds.sort_by(|a, b| a.id.cmp(&b.id));
        guilds
    }

    pub fn member(&self, guild_id: &str, user_id: &str) -> Option<Member> {
        self.snapshot_guild(guild_id)?.member(user_id).cloned()
    }

    pub fn contains_guild(&self, guild_id: &str) -> bool {
        matches!(self.read().get(guild_id), Some(GuildEntry::Available(_)))
    }

    /// True only for guilds that were seen and then removed.
    pub fn is_removed(&self, guild_id: &str) -> bool {
        matches!(self.read().get(guild_id), Some(GuildEntry::Removed))
    }

    pub fn guild_count(&self) -> usize {
        self.read()
            .values()
            .filter(|entry| matches!(entry, GuildEntry::Available(_)))
            .count()
    }
}
