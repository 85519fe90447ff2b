use std::time::Duration;

use async_trait::async_trait;
use folio_core::job::{EnqueueOptions, Job};
use folio_core::types::Timestamp;
use uuid::Uuid;

use super::{
    nack_outcome, stall_disposition, stall_error, Claim, ClaimedJob, EnqueueOutcome, JobQueue,
    NackOutcome, QueueConfig, QueueStats, RetentionPolicy, StallDisposition, StalledJob,
    STALL_REQUEUE_HOLD,
};
use crate::error::StoreError;
use crate::DbPool;

/// Column list for `queue_jobs` queries.
const COLUMNS: &str = "\
    job_id, payload, attempts, max_attempts, stall_count, worker_id, created_at";

/// Row shape selected by [`COLUMNS`].
#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    job_id: String,
    payload: serde_json::Value,
    attempts: i32,
    max_attempts: i32,
    stall_count: i32,
    worker_id: Option<String>,
    created_at: Timestamp,
}

impl From<QueueRow> for Job {
    fn from(row: QueueRow) -> Self {
        Job {
            job_id: row.job_id,
            payload: row.payload,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
            stall_count: row.stall_count.max(0) as u32,
            created_at: row.created_at,
        }
    }
}

/// Queue backed by the `queue_jobs` table.
///
/// Claims use `SELECT ... FOR UPDATE SKIP LOCKED` so any number of worker
/// processes can pull from the same table without double-dispatch.
#[derive(Clone)]
pub struct PgJobQueue {
    pool: DbPool,
    config: QueueConfig,
}

impl PgJobQueue {
    pub fn new(pool: DbPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }
}

fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, StoreError> {
        let result = sqlx::query(
            "INSERT INTO queue_jobs (job_id, payload, max_attempts) \
             VALUES ($1, $2, $3) \
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(&payload)
        .bind(options.max_attempts as i32)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() == 0 {
            EnqueueOutcome::Duplicate
        } else {
            EnqueueOutcome::Enqueued
        })
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError> {
        let token = Uuid::new_v4();
        let query = format!(
            "UPDATE queue_jobs \
             SET state = 'active', attempts = attempts + 1, claim_token = $1, \
                 worker_id = $2, heartbeat_at = NOW() \
             WHERE job_id = ( \
                 SELECT job_id FROM queue_jobs \
                 WHERE state = 'waiting' AND ready_at <= NOW() \
                 ORDER BY ready_at ASC, seq ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, QueueRow>(&query)
            .bind(token)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|row| {
            let job = Job::from(row);
            ClaimedJob {
                claim: Claim {
                    job_id: job.job_id.clone(),
                    token,
                    attempt: job.attempts,
                },
                job,
            }
        }))
    }

    async fn wait_for_work(&self, max_wait: Duration) -> Result<(), StoreError> {
        // Polling: other processes enqueue into the same table.
        tokio::time::sleep(max_wait).await;
        Ok(())
    }

    async fn heartbeat(&self, claim: &Claim) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET heartbeat_at = NOW() \
             WHERE job_id = $1 AND state = 'active' AND claim_token = $2",
        )
        .bind(&claim.job_id)
        .bind(claim.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn ack(&self, claim: &Claim) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queue_jobs \
             SET state = 'completed', finished_at = NOW(), claim_token = NULL \
             WHERE job_id = $1 AND state = 'active' AND claim_token = $2",
        )
        .bind(&claim.job_id)
        .bind(claim.token)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn nack(&self, claim: &Claim, error: &str) -> Result<NackOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row: Option<(i32, i32)> = sqlx::query_as(
            "SELECT attempts, max_attempts FROM queue_jobs \
             WHERE job_id = $1 AND state = 'active' AND claim_token = $2 \
             FOR UPDATE",
        )
        .bind(&claim.job_id)
        .bind(claim.token)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((attempts, max_attempts)) = row else {
            return Ok(NackOutcome::ClaimLost);
        };

        let outcome = nack_outcome(&self.config, attempts.max(0) as u32, max_attempts.max(0) as u32);
        match outcome {
            NackOutcome::Retrying { delay, .. } => {
                sqlx::query(
                    "UPDATE queue_jobs \
                     SET state = 'waiting', claim_token = NULL, last_error = $2, \
                         ready_at = NOW() + ($3::BIGINT * INTERVAL '1 millisecond') \
                     WHERE job_id = $1",
                )
                .bind(&claim.job_id)
                .bind(error)
                .bind(millis(delay))
                .execute(&mut *tx)
                .await?;
            }
            NackOutcome::Dead { .. } => {
                sqlx::query(
                    "UPDATE queue_jobs \
                     SET state = 'failed', claim_token = NULL, last_error = $2, \
                         finished_at = NOW() \
                     WHERE job_id = $1",
                )
                .bind(&claim.job_id)
                .bind(error)
                .execute(&mut *tx)
                .await?;
            }
            NackOutcome::ClaimLost => {}
        }

        tx.commit().await?;
        Ok(outcome)
    }

    async fn reap_stalled(&self, stall_timeout: Duration) -> Result<Vec<StalledJob>, StoreError> {
        let mut tx = self.pool.begin().await?;

        let query = format!(
            "SELECT {COLUMNS} FROM queue_jobs \
             WHERE state = 'active' \
               AND heartbeat_at <= NOW() - ($1::BIGINT * INTERVAL '1 millisecond') \
             FOR UPDATE SKIP LOCKED"
        );
        let rows = sqlx::query_as::<_, QueueRow>(&query)
            .bind(millis(stall_timeout))
            .fetch_all(&mut *tx)
            .await?;

        let mut stalled = Vec::with_capacity(rows.len());
        for row in rows {
            let error = stall_error(row.worker_id.as_deref(), stall_timeout);
            let mut job = Job::from(row);
            job.stall_count += 1;
            let disposition =
                stall_disposition(&self.config, job.stall_count, job.attempts, job.max_attempts);

            let sql = match disposition {
                StallDisposition::Requeued => {
                    "UPDATE queue_jobs \
                     SET state = 'waiting', claim_token = NULL, stall_count = $2, \
                         last_error = $3, \
                         ready_at = NOW() + ($4::BIGINT * INTERVAL '1 millisecond') \
                     WHERE job_id = $1"
                }
                StallDisposition::Dead => {
                    "UPDATE queue_jobs \
                     SET state = 'failed', claim_token = NULL, stall_count = $2, \
                         last_error = $3, finished_at = NOW() \
                     WHERE job_id = $1"
                }
            };
            let mut update = sqlx::query(sql)
                .bind(&job.job_id)
                .bind(job.stall_count as i32)
                .bind(&error);
            if disposition == StallDisposition::Requeued {
                update = update.bind(millis(STALL_REQUEUE_HOLD));
            }
            update.execute(&mut *tx).await?;

            stalled.push(StalledJob {
                job,
                error,
                disposition,
            });
        }

        tx.commit().await?;
        Ok(stalled)
    }

    async fn release(&self, job_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE queue_jobs SET ready_at = LEAST(ready_at, NOW()) \
             WHERE job_id = $1 AND state = 'waiting'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn prune(&self, policy: &RetentionPolicy) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM queue_jobs \
             WHERE state IN ('completed', 'failed') \
               AND ( \
                 finished_at < NOW() - ($1::BIGINT * INTERVAL '1 millisecond') \
                 OR job_id IN ( \
                     SELECT job_id FROM ( \
                         SELECT job_id, state, \
                                ROW_NUMBER() OVER (PARTITION BY state ORDER BY finished_at DESC) AS rn \
                         FROM queue_jobs \
                         WHERE state IN ('completed', 'failed') \
                     ) ranked \
                     WHERE (state = 'completed' AND rn > $2) \
                        OR (state = 'failed' AND rn > $3) \
                 ) \
               )",
        )
        .bind(millis(policy.max_age))
        .bind(policy.keep_completed as i64)
        .bind(policy.keep_failed as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let (waiting, delayed, active, completed, failed): (i64, i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT \
                     COUNT(*) FILTER (WHERE state = 'waiting' AND ready_at <= NOW()), \
                     COUNT(*) FILTER (WHERE state = 'waiting' AND ready_at > NOW()), \
                     COUNT(*) FILTER (WHERE state = 'active'), \
                     COUNT(*) FILTER (WHERE state = 'completed'), \
                     COUNT(*) FILTER (WHERE state = 'failed') \
                 FROM queue_jobs",
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(QueueStats {
            waiting: waiting as u64,
            delayed: delayed as u64,
            active: active as u64,
            completed: completed as u64,
            failed: failed as u64,
        })
    }
}
