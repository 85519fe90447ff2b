//! Progress store: the latest [`JobProgress`] per job, with per-key expiry.
//!
//! The store is the single source of truth for "what state is job X in".
//! Entries expire after the retention TTL regardless of outcome, so
//! callers must treat a missing entry as "unknown or expired".

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use folio_core::job::JobProgress;
use sqlx::types::Json;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::DbPool;

/// Default retention window for progress entries (one hour).
pub const DEFAULT_PROGRESS_TTL: Duration = Duration::from_secs(3600);

/// Key-value store with get / set-with-TTL semantics.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Latest unexpired record for `job_id`.
    async fn get(&self, job_id: &str) -> Result<Option<JobProgress>, StoreError>;

    /// Overwrite the record for `progress.job_id`, expiring after `ttl`.
    async fn set(&self, progress: &JobProgress, ttl: Duration) -> Result<(), StoreError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

struct Entry {
    progress: JobProgress,
    expires_at: Instant,
}

/// Process-local progress store.
///
/// Expiry runs on the tokio clock, so paused-time tests can advance past
/// the TTL deterministically.
#[derive(Default)]
pub struct MemoryProgressStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired or not.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn get(&self, job_id: &str) -> Result<Option<JobProgress>, StoreError> {
        let entries = self.entries.read().await;
        Ok(entries
            .get(job_id)
            .filter(|e| e.expires_at > Instant::now())
            .map(|e| e.progress.clone()))
    }

    async fn set(&self, progress: &JobProgress, ttl: Duration) -> Result<(), StoreError> {
        let entry = Entry {
            progress: progress.clone(),
            expires_at: Instant::now() + ttl,
        };
        self.entries
            .write()
            .await
            .insert(progress.job_id.clone(), entry);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        Ok((before - entries.len()) as u64)
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// Progress store backed by the `job_progress` table.
#[derive(Clone)]
pub struct PgProgressStore {
    pool: DbPool,
}

impl PgProgressStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn get(&self, job_id: &str) -> Result<Option<JobProgress>, StoreError> {
        let row = sqlx::query_scalar::<_, Json<JobProgress>>(
            "SELECT data FROM job_progress WHERE job_id = $1 AND expires_at > NOW()",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|Json(p)| p))
    }

    async fn set(&self, progress: &JobProgress, ttl: Duration) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO job_progress (job_id, data, expires_at) \
             VALUES ($1, $2, NOW() + ($3::BIGINT * INTERVAL '1 millisecond')) \
             ON CONFLICT (job_id) DO UPDATE \
             SET data = EXCLUDED.data, expires_at = EXCLUDED.expires_at",
        )
        .bind(&progress.job_id)
        .bind(Json(progress))
        .bind(ttl.as_millis() as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM job_progress WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

// ---------------------------------------------------------------------------
// ProgressTracker
// ---------------------------------------------------------------------------

/// Thin wrapper binding a [`ProgressStore`] to the retention TTL.
///
/// Cheap to clone; every component that reads or writes progress holds
/// one of these instead of the raw store.
#[derive(Clone)]
pub struct ProgressTracker {
    store: Arc<dyn ProgressStore>,
    ttl: Duration,
}

impl ProgressTracker {
    pub fn new(store: Arc<dyn ProgressStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    /// Retention window applied to every write.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Overwrite the job's record.
    pub async fn record(&self, progress: &JobProgress) -> Result<(), StoreError> {
        tracing::trace!(
            job_id = %progress.job_id,
            status = %progress.status,
            progress = progress.progress,
            "Recording job progress",
        );
        self.store.set(progress, self.ttl).await
    }

    /// Latest record, or `None` when unknown or expired.
    pub async fn get(&self, job_id: &str) -> Result<Option<JobProgress>, StoreError> {
        self.store.get(job_id).await
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.store.purge_expired().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::job::JobStatus;

    #[tokio::test]
    async fn set_then_get_returns_latest_write() {
        let store = MemoryProgressStore::new();
        store
            .set(&JobProgress::queued("j1"), DEFAULT_PROGRESS_TTL)
            .await
            .unwrap();

        let mut p = JobProgress::queued("j1");
        p.status = JobStatus::Processing;
        p.progress = 40;
        store.set(&p, DEFAULT_PROGRESS_TTL).await.unwrap();

        let got = store.get("j1").await.unwrap().expect("entry should exist");
        assert_eq!(got.status, JobStatus::Processing);
        assert_eq!(got.progress, 40);
    }

    #[tokio::test]
    async fn get_unknown_is_none() {
        let store = MemoryProgressStore::new();
        assert!(store.get("missing").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = MemoryProgressStore::new();
        store
            .set(&JobProgress::queued("j1"), Duration::from_secs(60))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(store.get("j1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("j1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn overwrite_refreshes_ttl() {
        let store = MemoryProgressStore::new();
        let ttl = Duration::from_secs(60);
        store.set(&JobProgress::queued("j1"), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        store.set(&JobProgress::queued("j1"), ttl).await.unwrap();

        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(store.get("j1").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn purge_removes_only_expired() {
        let store = MemoryProgressStore::new();
        store
            .set(&JobProgress::queued("short"), Duration::from_secs(10))
            .await
            .unwrap();
        store
            .set(&JobProgress::queued("long"), Duration::from_secs(100))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.purge_expired().await.unwrap(), 1);
        assert_eq!(store.len().await, 1);
        assert!(store.get("long").await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn tracker_applies_its_ttl() {
        let tracker = ProgressTracker::new(
            Arc::new(MemoryProgressStore::new()),
            Duration::from_secs(30),
        );
        tracker.record(&JobProgress::queued("j1")).await.unwrap();
        assert!(tracker.get("j1").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(tracker.get("j1").await.unwrap().is_none());
    }
}
