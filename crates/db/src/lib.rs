//! Storage layer for the generation pipeline.
//!
//! - [`progress_store`]: expiring key-value store of the latest
//!   [`JobProgress`](folio_core::job::JobProgress) per job, plus the
//!   [`ProgressTracker`](progress_store::ProgressTracker) wrapper that
//!   applies the retention TTL.
//! - [`job_queue`]: the durable job queue (claim / ack / nack / stall
//!   reaping / retention).
//!
//! Each seam is a trait with an in-memory backend (tests, single-process
//! setups) and a Postgres backend.

use sqlx::postgres::PgPoolOptions;

pub mod error;
pub mod job_queue;
pub mod progress_store;

pub use error::StoreError;
pub use job_queue::{
    Claim, ClaimedJob, EnqueueOutcome, JobQueue, MemoryJobQueue, NackOutcome, PgJobQueue,
    QueueConfig, QueueStats, RetentionPolicy, StallDisposition, StalledJob, STALL_REQUEUE_HOLD,
};
pub use progress_store::{MemoryProgressStore, PgProgressStore, ProgressStore, ProgressTracker};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify the database is reachable.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply all pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
