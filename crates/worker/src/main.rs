use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use folio_db::{PgJobQueue, PgProgressStore, ProgressTracker};
use folio_events::PgEventBridge;
use folio_pipeline::HttpGenerator;
use folio_worker::{JobService, WorkerConfig, WorkerPool};

/// How long queued events get to reach Postgres after the pool stops.
const EVENT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "folio_worker=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().context("Invalid worker configuration")?;
    tracing::info!(
        concurrency = config.concurrency,
        generation_url = %config.generation_url,
        "Loaded worker configuration"
    );

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

    // --- Event bridge ---
    let bridge_cancel = CancellationToken::new();
    let (bridge, notifier_handle) = PgEventBridge::spawn(pool.clone(), bridge_cancel.clone());

    // --- Service ---
    let service = Arc::new(JobService::new(
        Arc::new(PgJobQueue::new(pool.clone(), config.queue.queue_config())),
        ProgressTracker::new(
            Arc::new(PgProgressStore::new(pool.clone())),
            config.queue.progress_ttl,
        ),
        Arc::new(bridge),
        config.queue.default_enqueue_options(),
    ));

    let generator = HttpGenerator::new(config.generation_url.clone(), config.generation_timeout)
        .context("Failed to build generation client")?;

    // --- Pool ---
    let worker_pool = WorkerPool::new(service, Arc::new(generator), config.pool_config());
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_cancel.cancel();
    });

    let result = worker_pool.run(cancel).await;

    // --- Post-shutdown cleanup ---
    bridge_cancel.cancel();
    let _ = tokio::time::timeout(EVENT_FLUSH_TIMEOUT, notifier_handle).await;
    tracing::info!("Event bridge stopped");

    // A store failure exits non-zero so the supervisor restarts the process.
    result.context("Worker pool stopped on a store failure")?;
    tracing::info!("Graceful shutdown complete");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
///
/// Slots finish the attempt they are running; anything abandoned past the
/// supervisor's kill timeout is picked up again by the stall watchdog.
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
