use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use folio_api::config::ServerConfig;
use folio_api::fanout::EventForwarder;
use folio_api::router::build_app_router;
use folio_api::state::AppState;
use folio_api::ws::{run_heartbeat, WsManager, HEARTBEAT_INTERVAL};
use folio_db::{PgJobQueue, PgProgressStore, ProgressTracker};
use folio_events::{EventBus, PgEventBridge};
use folio_worker::{JobService, RetentionSweeper, StallWatchdog};

/// How long each background task gets to stop after shutdown begins.
const TASK_STOP_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "folio_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = ServerConfig::from_env().context("Invalid server configuration")?;

    // --- Database ---
    let pool = folio_db::create_pool(&config.database_url)
        .await
        .context("Failed to connect to database")?;
    folio_db::health_check(&pool)
        .await
        .context("Database health check failed")?;
    folio_db::run_migrations(&pool)
        .await
        .context("Failed to run database migrations")?;
    tracing::info!("Database ready");

    let cancel = CancellationToken::new();

    // --- Event bridge: Postgres NOTIFY -> local bus -> job rooms ---
    let event_bus = Arc::new(EventBus::default());
    let ws_manager = Arc::new(WsManager::new());

    let forwarder_handle = tokio::spawn(
        EventForwarder::new(Arc::clone(&ws_manager)).run(event_bus.subscribe(), cancel.clone()),
    );
    let relay_pool = pool.clone();
    let relay_bus = Arc::clone(&event_bus);
    let relay_cancel = cancel.clone();
    let relay_handle = tokio::spawn(async move {
        if let Err(e) = folio_events::pg::relay(relay_pool, relay_bus, relay_cancel).await {
            tracing::error!(error = %e, "Event relay stopped");
        }
    });

    // Stall surfacing from this process is published through Postgres like
    // any worker update, so every API replica sees it.
    let (bridge, notifier_handle) = PgEventBridge::spawn(pool.clone(), cancel.clone());

    // --- Service ---
    let jobs = Arc::new(JobService::new(
        Arc::new(PgJobQueue::new(pool.clone(), config.queue.queue_config())),
        ProgressTracker::new(
            Arc::new(PgProgressStore::new(pool.clone())),
            config.queue.progress_ttl,
        ),
        Arc::new(bridge),
        config.queue.default_enqueue_options(),
    ));

    // --- Background maintenance ---
    let watchdog_handle = tokio::spawn(
        StallWatchdog::new(
            Arc::clone(&jobs),
            config.queue.stall_timeout,
            config.queue.stall_check_interval,
        )
        .run(cancel.clone()),
    );
    let sweeper_handle = tokio::spawn(
        RetentionSweeper::new(
            Arc::clone(&jobs),
            config.queue.retention,
            config.queue.retention_interval,
        )
        .run(cancel.clone()),
    );

    let heartbeat_handle = tokio::spawn(run_heartbeat(
        Arc::clone(&ws_manager),
        HEARTBEAT_INTERVAL,
        cancel.clone(),
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        ws_manager: Arc::clone(&ws_manager),
        jobs,
    };
    let app = build_app_router(state, &config);

    let addr: SocketAddr = config
        .bind_addr()
        .parse()
        .with_context(|| format!("Invalid bind address {}", config.bind_addr()))?;
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped, cleaning up background tasks");
    cancel.cancel();
    for (name, handle) in [
        ("stall watchdog", watchdog_handle),
        ("retention sweeper", sweeper_handle),
        ("event forwarder", forwarder_handle),
        ("event relay", relay_handle),
        ("event notifier", notifier_handle),
        ("websocket heartbeat", heartbeat_handle),
    ] {
        if tokio::time::timeout(TASK_STOP_TIMEOUT, handle).await.is_err() {
            tracing::warn!(task = name, "Background task did not stop in time");
        }
    }

    ws_manager.shutdown_all().await;

    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
