use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use guildmirror_server::config::MirrorConfig;
use guildmirror_server::db::pool::{create_pool, run_migrations};
use guildmirror_server::engine::audit::{AuditSink, ChannelAuditSink, NullAuditSink, spawn_audit_writer};
use guildmirror_server::engine::dispatcher::Dispatcher;
use guildmirror_server::engine::store::GuildStore;
use guildmirror_server::ingest::listener::start_ingest_listener;
use guildmirror_server::web::app_state::AppState;
use guildmirror_server::web::router::build_router;

const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "guildmirror", about = "Event-fed guild state mirror with change auditing")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "guildmirror.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = MirrorConfig::load(&cli.config)?;

    let pool = create_pool(&config.database.url)
        .await
        .context("failed to connect to database")?;
    run_migrations(&pool)
        .await
        .context("failed to run database migrations")?;

    let mut audit_writer = None;
    let sink: Arc<dyn AuditSink> = if config.audit.enabled {
        let (sink, rx) = ChannelAuditSink::new(config.audit.queue_capacity);
        audit_writer = Some(spawn_audit_writer(pool.clone(), rx));
        Arc::new(sink)
    } else {
        info!("Audit log disabled");
        Arc::new(NullAuditSink)
    };

    let store = Arc::new(GuildStore::new(sink));
    let dispatcher = Arc::new(Dispatcher::new(store.clone()));
    let cancel = CancellationToken::new();

    let (events_tx, events_rx) = mpsc::channel(config.dispatcher.queue_capacity.max(1));
    let dispatch_task = tokio::spawn(dispatcher.clone().run(events_rx, cancel.clone()));

    let ingest_addr = config.server.ingest_address.clone();
    let ingest_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = start_ingest_listener(&ingest_addr, events_tx, ingest_cancel.clone()).await {
            error!(error = %e, address = %ingest_addr, "ingest listener failed");
            ingest_cancel.cancel();
        }
    });

    let app = build_router(Arc::new(AppState {
        store,
        db: pool,
    }));

    let web_addr = &config.server.web_address;
    info!(
        "Guild mirror starting. Web: {}, Ingest: {}",
        web_addr, config.server.ingest_address
    );

    let listener = tokio::net::TcpListener::bind(web_addr)
        .await
        .with_context(|| format!("failed to bind web listener on {web_addr}"))?;

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
        }
        shutdown.cancel();
    });

    let web_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { web_cancel.cancelled().await })
        .await
        .context("web server error")?;

    cancel.cancel();
    dispatch_task.await.context("dispatcher task panicked")?;

    let stats = dispatcher.stats();
    info!(
        applied = stats.applied,
        dropped = stats.dropped,
        faults = stats.faults,
        ignored = stats.ignored,
        "Dispatcher stopped"
    );

    // The writer exits once the last store handle drops and the queue drains
    drop(dispatcher);
    if let Some(writer) = audit_writer
        && tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, writer).await.is_err()
    {
        warn!("Audit writer did not drain before shutdown");
    }
    Ok(())
}
