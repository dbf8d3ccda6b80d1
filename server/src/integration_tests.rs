//! Cross-layer tests: ingest socket through dispatcher and store to the
//! persisted audit log and the HTTP read model.
//!
//! Each test creates its own in-memory SQLite database so tests are fully isolated.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::{Value, json};
    use sqlx::SqlitePool;
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    use crate::db::pool::{create_pool, run_migrations};
    use crate::db::queries::audit_log;
    use crate::engine::audit::{
        AuditEvent, AuditSink, ChannelAuditSink, RecordingAuditSink, spawn_audit_writer,
    };
    use crate::engine::dispatcher::Dispatcher;
    use crate::engine::events::GatewayEvent;
    use crate::engine::models::{Channel, Guild};
    use crate::engine::store::GuildStore;
    use crate::ingest::listener::serve_ingest;
    use crate::web::app_state::AppState;
    use crate::web::router::build_router;

    // ── Helpers ──────────────────────────────────────────────────

    async fn setup_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    struct Harness {
        store: Arc<GuildStore>,
        dispatcher: Arc<Dispatcher>,
        pool: SqlitePool,
        addr: std::net::SocketAddr,
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    }

    /// Full pipeline: TCP ingest → dispatcher → store → audit writer → SQLite.
    async fn start_pipeline() -> Harness {
        let pool = setup_db().await;
        let (sink, audit_rx) = ChannelAuditSink::new(64);
        let writer = spawn_audit_writer(pool.clone(), audit_rx);

        let store = Arc::new(GuildStore::new(Arc::new(sink)));
        let dispatcher = Arc::new(Dispatcher::new(store.clone()));
        let cancel = CancellationToken::new();

        let (tx, rx) = mpsc::channel(64);
        let dispatch = tokio::spawn(dispatcher.clone().run(rx, cancel.clone()));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let ingest = tokio::spawn(serve_ingest(listener, tx, cancel.clone()));

        Harness {
            store,
            dispatcher,
            pool,
            addr,
            cancel,
            tasks: vec![writer, dispatch, ingest],
        }
    }

    fn frame(kind: &str, payload: Value) -> String {
        format!("{}\n", json!({ "t": kind, "d": payload }))
    }

    /// Poll `check` until it holds or a few seconds pass.
    async fn eventually<F: Fn() -> bool>(check: F) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    async fn audit_rows(pool: &SqlitePool, guild_id: &str) -> Vec<crate::db::models::AuditLogRow> {
        audit_log::list_entries(pool, guild_id, None, 100, None)
            .await
            .unwrap()
    }

    // ── End-to-end ───────────────────────────────────────────────

    #[tokio::test]
    async fn test_socket_to_audit_log() {
        let harness = start_pipeline().await;
        let mut client = TcpStream::connect(harness.addr).await.unwrap();

        let frames = [
            frame(
                "GUILD_CREATE",
                json!({
                    "id": "G1",
                    "name": "Guild",
                    "owner_id": "u0",
                    "channels": [],
                    "members": [{"user": {"id": "u1", "username": "alice"}, "roles": ["1", "2", "3"]}],
                    "emojis": [{"id": "A", "name": "a"}, {"id": "B", "name": "b"}, {"id": "C", "name": "c"}]
                }),
            ),
            frame("CHANNEL_CREATE", json!({"id": "C1", "guild_id": "G1", "name": "general"})),
            frame("CHANNEL_UPDATE", json!({"id": "C1", "guild_id": "G1", "name": "general-chat"})),
            frame(
                "GUILD_MEMBER_UPDATE",
                json!({"guild_id": "G1", "user": {"id": "u1", "username": "alice"}, "roles": ["2", "3", "4"]}),
            ),
            frame(
                "GUILD_EMOJIS_UPDATE",
                json!({"guild_id": "G1", "emojis": [{"id": "B", "name": "b"}, {"id": "C", "name": "c"}, {"id": "D", "name": "d"}]}),
            ),
            "garbage that is not json\n".to_string(),
            frame("TYPING_START", json!({"channel_id": "C1"})),
            frame("GUILD_UPDATE", json!({"id": "G1", "name": "Guild Renamed", "owner_id": "u0"})),
        ];
        for f in &frames {
            client.write_all(f.as_bytes()).await.unwrap();
        }

        let dispatcher = harness.dispatcher.clone();
        eventually(move || dispatcher.stats().applied == 6).await;
        assert_eq!(harness.store.snapshot_guild("G1").unwrap().name, "Guild Renamed");

        // GUILD_UPDATE overwrites nested collections with what it carries
        let snapshot = harness.store.snapshot_guild("G1").unwrap();
        assert!(snapshot.channels.is_empty());

        // channel rename, member roles, emoji delete A, emoji create D, guild rename
        let pool = harness.pool.clone();
        let mut rows = Vec::new();
        for _ in 0..200 {
            rows = audit_rows(&pool, "G1").await;
            if rows.len() >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rows.len(), 5);

        let mut actions: Vec<&str> = rows.iter().map(|r| r.action_type.as_str()).collect();
        actions.sort_unstable();
        assert_eq!(
            actions,
            vec!["channel_update", "emoji_create", "emoji_delete", "guild_update", "member_update"]
        );

        let member_row = rows.iter().find(|r| r.action_type == "member_update").unwrap();
        let changes: Value = serde_json::from_str(member_row.changes.as_deref().unwrap()).unwrap();
        assert_eq!(changes["roles"]["added"], json!(["4"]));
        assert_eq!(changes["roles"]["removed"], json!(["1"]));

        let channel_row = rows.iter().find(|r| r.action_type == "channel_update").unwrap();
        assert_eq!(channel_row.target_id, "C1");
        let changes: Value = serde_json::from_str(channel_row.changes.as_deref().unwrap()).unwrap();
        assert_eq!(changes["name"]["old"], "general");
        assert_eq!(changes["name"]["new"], "general-chat");

        assert_eq!(harness.dispatcher.stats().ignored, 1);

        // The same data through the HTTP read model
        let app = build_router(Arc::new(AppState {
            store: harness.store.clone(),
            db: harness.pool.clone(),
        }));
        let response = app
            .oneshot(
                Request::get("/api/guilds/G1/audit-log?action_type=emoji_delete")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json[0]["target_id"], "A");
        assert_eq!(json[0]["target_type"], "emoji");

        harness.cancel.cancel();
        for task in harness.tasks.into_iter().skip(1) {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_events_for_unknown_guild_leave_store_untouched() {
        let harness = start_pipeline().await;
        let mut client = TcpStream::connect(harness.addr).await.unwrap();

        client
            .write_all(frame("CHANNEL_CREATE", json!({"id": "C1", "guild_id": "ghost", "name": "x"})).as_bytes())
            .await
            .unwrap();
        client
            .write_all(frame("GUILD_CREATE", json!({"id": "G2", "name": "Real"})).as_bytes())
            .await
            .unwrap();

        let store = harness.store.clone();
        eventually(move || store.contains_guild("G2")).await;

        assert!(harness.store.snapshot_guild("ghost").is_none());
        assert_eq!(harness.store.guild_count(), 1);
        assert_eq!(harness.dispatcher.stats().dropped, 1);
        harness.cancel.cancel();
    }

    // ── Fault containment ────────────────────────────────────────

    /// Panics on the first notification only.
    #[derive(Default)]
    struct FlakySink {
        tripped: AtomicBool,
        inner: RecordingAuditSink,
    }

    impl AuditSink for FlakySink {
        fn emit(&self, event: AuditEvent) {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                panic!("audit backend unavailable");
            }
            self.inner.emit(event);
        }
    }

    #[tokio::test]
    async fn test_fault_does_not_stop_the_loop() {
        let sink = Arc::new(FlakySink::default());
        let store = Arc::new(GuildStore::new(sink.clone()));
        let dispatcher = Arc::new(Dispatcher::new(store.clone()));
        let (tx, rx) = mpsc::channel(16);

        let guild = |name: &str| {
            GatewayEvent::GuildCreate(Guild {
                id: "G1".into(),
                name: name.into(),
                ..Default::default()
            })
        };
        tx.send(guild("one")).await.unwrap();
        tx.send(guild("two")).await.unwrap();
        tx.send(guild("three")).await.unwrap();
        drop(tx);

        dispatcher.clone().run(rx, CancellationToken::new()).await;

        let stats = dispatcher.stats();
        assert_eq!(stats.faults, 1);
        assert_eq!(stats.applied, 2);
        assert_eq!(store.snapshot_guild("G1").unwrap().name, "three");
        assert_eq!(sink.inner.events().len(), 1);
    }

    // ── Snapshot consistency ─────────────────────────────────────

    fn versioned_guild(version: u32) -> Guild {
        let name = format!("v{version}");
        Guild {
            id: "G1".into(),
            name: name.clone(),
            channels: (0..version % 7 + 1)
                .map(|i| Channel {
                    id: format!("C{i}"),
                    name: name.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_readers_never_observe_partial_updates() {
        let store = Arc::new(GuildStore::new(Arc::new(RecordingAuditSink::default())));
        store.upsert_guild(&versioned_guild(0)).unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for version in 1..=500 {
                    store.upsert_guild(&versioned_guild(version)).unwrap();
                    // Per-entity events interleave with whole-guild replacements
                    let mut channel = versioned_guild(version).channels[0].clone();
                    channel.guild_id = "G1".into();
                    store.upsert_channel(&channel).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snapshot = store.snapshot_guild("G1").unwrap();
                        let expected = snapshot.name.clone();
                        let before = snapshot.channels.len();
                        assert!(snapshot.channels.iter().all(|c| c.name == expected));
                        assert!(snapshot.channels.iter().all(|c| c.guild_id == "G1"));
                        std::thread::yield_now();
                        // A held snapshot never changes underneath its reader
                        assert_eq!(snapshot.channels.len(), before);
                        assert_eq!(snapshot.name, expected);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.snapshot_guild("G1").unwrap().name, "v500");
    }

    #[tokio::test]
    async fn test_removed_guild_can_return() {
        let pool = setup_db().await;
        let (sink, rx) = ChannelAuditSink::new(8);
        let writer = spawn_audit_writer(pool.clone(), rx);
        let store = Arc::new(GuildStore::new(Arc::new(sink)));
        let dispatcher = Dispatcher::new(store.clone());

        dispatcher.handle(GatewayEvent::GuildCreate(Guild {
            id: "G1".into(),
            name: "first".into(),
            ..Default::default()
        }));
        dispatcher.handle(GatewayEvent::GuildDelete(Guild {
            id: "G1".into(),
            ..Default::default()
        }));
        assert!(store.is_removed("G1"));
        assert!(store.guilds().is_empty());

        dispatcher.handle(GatewayEvent::GuildCreate(Guild {
            id: "G1".into(),
            name: "second".into(),
            ..Default::default()
        }));
        assert!(!store.is_removed("G1"));
        assert_eq!(store.snapshot_guild("G1").unwrap().name, "second");

        // Re-creation after removal is not an update
        drop(dispatcher);
        drop(store);
        writer.await.unwrap();
        assert!(audit_rows(&pool, "G1").await.is_empty());
    }
}
