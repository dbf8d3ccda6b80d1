use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{DispatchError, StoreError};
use super::events::GatewayEvent;
use super::store::GuildStore;

/// Running totals for the dispatcher loop.
#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    dropped: AtomicU64,
    faults: AtomicU64,
    ignored: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub applied: u64,
    pub dropped: u64,
    pub faults: u64,
    pub ignored: u64,
}

/// Routes gateway events, one at a time, to the matching store mutation.
pub struct Dispatcher {
    store: Arc<GuildStore>,
    counters: Counters,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Dispatcher {
    pub fn new(store: Arc<GuildStore>) -> Self {
        Self {
            store,
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &Arc<GuildStore> {
        &self.store
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            faults: self.counters.faults.load(Ordering::Relaxed),
            ignored: self.counters.ignored.load(Ordering::Relaxed),
        }
    }

    /// Apply one event inside a recovery boundary. A panic anywhere in the
    /// application becomes [`DispatchError::UnexpectedFault`].
    pub fn dispatch(&self, event: GatewayEvent) -> Result<(), DispatchError> {
        let kind = event.kind().to_string();
        match panic::catch_unwind(AssertUnwindSafe(|| self.apply(event))) {
            Ok(result) => result.map_err(DispatchError::from),
            Err(payload) => Err(DispatchError::UnexpectedFault {
                kind,
                message: panic_message(payload.as_ref()),
            }),
        }
    }

    /// Dispatch and report. Never fails: every error is logged and counted.
    pub fn handle(&self, event: GatewayEvent) {
        if let GatewayEvent::Unknown(kind) = &event {
            debug!(%kind, "ignoring untracked event");
            self.counters.ignored.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let kind = event.kind().to_string();
        let guild_id = event.guild_id().unwrap_or_default().to_string();

        match self.dispatch(event) {
            Ok(()) => {
                debug!(%kind, %guild_id, "event applied");
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
            }
            Err(DispatchError::Store(e)) => {
                warn!(%kind, %guild_id, error = %e, "event dropped");
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(DispatchError::UnexpectedFault { message, .. }) => {
                error!(
                    %kind,
                    %guild_id,
                    panic = %message,
                    "unexpected fault while applying event"
                );
                self.counters.faults.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Consume events in arrival order until the queue closes or `cancel` fires.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<GatewayEvent>, cancel: CancellationToken) {
        info!("dispatcher started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher shutting down");
                    break;
                }
                next = rx.recv() => {
                    match next {
                        Some(event) => self.handle(event),
                        None => {
                            info!("event queue closed, dispatcher stopping");
                            break;
                        }
                    }
                }
            }
        }
    }

    fn apply(&self, event: GatewayEvent) -> Result<(), StoreError> {
        match event {
            GatewayEvent::GuildCreate(guild) | GatewayEvent::GuildUpdate(guild) => {
                self.store.upsert_guild(&guild)
            }
            GatewayEvent::GuildDelete(guild) => self.store.remove_guild(&guild.id),
            GatewayEvent::ChannelCreate(channel) | GatewayEvent::ChannelUpdate(channel) => {
                self.store.upsert_channel(&channel)
            }
            GatewayEvent::ChannelDelete(channel) => self.store.remove_channel(&channel),
            GatewayEvent::GuildMemberAdd(member) | GatewayEvent::GuildMemberUpdate(member) => {
                self.store.upsert_member(&member)
            }
            GatewayEvent::GuildMemberRemove(member) => self.store.remove_member(&member),
            GatewayEvent::GuildMembersChunk(mut chunk) => {
                for member in &mut chunk.members {
                    member.guild_id.clone_from(&chunk.guild_id);
                }
                self.store.upsert_members(&chunk.guild_id, &chunk.members)
            }
            GatewayEvent::GuildEmojisUpdate(update) => {
                self.store.upsert_emoji_set(&update.guild_id, &update.emojis)
            }
            GatewayEvent::PresenceUpdate(presence) => self.store.apply_presence(&presence),
            GatewayEvent::GuildRoleCreate(update) | GatewayEvent::GuildRoleUpdate(update) => {
                self.store.upsert_role(&update.guild_id, &update.role)
            }
            GatewayEvent::GuildRoleDelete(delete) => {
                self.store.remove_role(&delete.guild_id, &delete.role_id)
            }
            GatewayEvent::VoiceStateUpdate(state) => self.store.update_voice_state(&state),
            GatewayEvent::Unknown(_) => Ok(()),
        }
    }
}
