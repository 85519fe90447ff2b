//! Durable job queue.
//!
//! Lifecycle of a queued job:
//!
//! ```text
//! enqueue -> waiting --claim--> active --ack--> completed
//!              ^                  |
//!              |   nack (retry)   |--nack (exhausted)--> failed
//!              +------------------+
//!              |  stall (1st)     |--stall (2nd / last attempt)--> failed
//! ```
//!
//! Every claim carries a random token. Heartbeat, ack and nack must present
//! the token of the current claim; once the stall watchdog has requeued a
//! job, the presumed-dead worker's token no longer matches and its late
//! writes are rejected. This is what keeps one owner per job.

mod memory;
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use folio_core::backoff::BackoffPolicy;
use folio_core::job::{EnqueueOptions, Job};
use folio_core::types::JobId;
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;

pub use memory::MemoryJobQueue;
pub use postgres::PgJobQueue;

/// Default number of stall requeues before a job is failed.
pub const DEFAULT_MAX_STALLS: u32 = 1;

/// How long a job requeued by [`JobQueue::reap_stalled`] stays unclaimable.
///
/// The watchdog records the requeue in the progress store and then calls
/// [`JobQueue::release`]; the hold only runs out on its own when that never
/// happens.
pub const STALL_REQUEUE_HOLD: Duration = Duration::from_secs(30);

/// Queue-wide tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueueConfig {
    /// Delay schedule applied between failed attempts.
    pub backoff: BackoffPolicy,
    /// Stall requeues allowed per job. The next stall is terminal.
    pub max_stalls: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::exponential(
                Duration::from_secs(5),
                Duration::from_secs(300),
            ),
            max_stalls: DEFAULT_MAX_STALLS,
        }
    }
}

/// Proof of ownership handed out by [`JobQueue::claim`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: JobId,
    pub token: Uuid,
    /// 1-based attempt number this claim runs.
    pub attempt: u32,
}

/// A claimed job together with its ownership token.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub job: Job,
    pub claim: Claim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// A job with this id already exists; nothing was changed.
    Duplicate,
}

/// Result of reporting a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// The job goes back to the ready set after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// `attempts` reached `max_attempts`; the job is terminally failed.
    Dead { attempts: u32 },
    /// The claim is no longer current (the job was reaped as stalled).
    ClaimLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StallDisposition {
    /// Returned to the ready set immediately.
    Requeued,
    /// Stalled too often or on its last attempt.
    Dead,
}

/// A job the watchdog found without a recent heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct StalledJob {
    /// Snapshot after the stall was applied.
    pub job: Job,
    /// Error detail, always prefixed with `stalled:`.
    pub error: String,
    pub disposition: StallDisposition,
}

/// Housekeeping bounds for terminal jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub keep_completed: usize,
    pub keep_failed: usize,
    /// Terminal jobs older than this are dropped regardless of the counts.
    pub max_age: Duration,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            keep_completed: 100,
            keep_failed: 500,
            max_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Queue introspection counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    /// Ready to be claimed now.
    pub waiting: u64,
    /// Waiting for a retry backoff to elapse.
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

/// The queue seam. Implementations must make `claim` atomic: a job is
/// handed to at most one caller until it is acked, nacked or reaped.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Add a job. Idempotent on `job_id`.
    async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, StoreError>;

    /// Take ownership of the oldest ready job, if any.
    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError>;

    /// Sleep until work may be available, at most `max_wait`.
    async fn wait_for_work(&self, max_wait: Duration) -> Result<(), StoreError>;

    /// Refresh the claim's liveness. `false` when the claim is no longer current.
    async fn heartbeat(&self, claim: &Claim) -> Result<bool, StoreError>;

    /// Mark the claimed job completed. `false` when the claim is no longer current.
    async fn ack(&self, claim: &Claim) -> Result<bool, StoreError>;

    /// Report a failed attempt and schedule a retry or fail the job.
    async fn nack(&self, claim: &Claim, error: &str) -> Result<NackOutcome, StoreError>;

    /// Requeue or fail every active job with no heartbeat within `stall_timeout`.
    ///
    /// Requeued jobs are held for [`STALL_REQUEUE_HOLD`] so the caller can
    /// record the requeue before another worker claims them.
    async fn reap_stalled(&self, stall_timeout: Duration) -> Result<Vec<StalledJob>, StoreError>;

    /// End the hold on a job requeued by `reap_stalled`. `false` when the
    /// job is not waiting.
    async fn release(&self, job_id: &str) -> Result<bool, StoreError>;

    /// Drop terminal jobs beyond the retention bounds. Returns the number removed.
    async fn prune(&self, policy: &RetentionPolicy) -> Result<u64, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;
}

/// Decide what a failed attempt turns into.
fn nack_outcome(config: &QueueConfig, attempts: u32, max_attempts: u32) -> NackOutcome {
    if attempts < max_attempts {
        NackOutcome::Retrying {
            attempt: attempts,
            delay: config.backoff.delay_for_attempt(attempts),
        }
    } else {
        NackOutcome::Dead { attempts }
    }
}

/// Decide what a stall turns into. `stall_count` already includes this stall.
fn stall_disposition(
    config: &QueueConfig,
    stall_count: u32,
    attempts: u32,
    max_attempts: u32,
) -> StallDisposition {
    if stall_count > config.max_stalls || attempts >= max_attempts {
        StallDisposition::Dead
    } else {
        StallDisposition::Requeued
    }
}

fn stall_error(worker_id: Option<&str>, stall_timeout: Duration) -> String {
    format!(
        "{}: no heartbeat from worker {} within {}s",
        folio_core::job::STALLED_ERROR_PREFIX,
        worker_id.unwrap_or("unknown"),
        stall_timeout.as_secs()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn nack_retries_until_last_attempt() {
        let config = QueueConfig::default();
        assert_matches!(
            nack_outcome(&config, 1, 3),
            NackOutcome::Retrying { attempt: 1, delay } if delay == Duration::from_secs(5)
        );
        assert_matches!(
            nack_outcome(&config, 2, 3),
            NackOutcome::Retrying { attempt: 2, delay } if delay == Duration::from_secs(10)
        );
        assert_eq!(nack_outcome(&config, 3, 3), NackOutcome::Dead { attempts: 3 });
    }

    #[test]
    fn second_stall_is_terminal() {
        let config = QueueConfig::default();
        assert_eq!(stall_disposition(&config, 1, 1, 3), StallDisposition::Requeued);
        assert_eq!(stall_disposition(&config, 2, 2, 3), StallDisposition::Dead);
    }

    #[test]
    fn stall_on_last_attempt_is_terminal() {
        let config = QueueConfig::default();
        assert_eq!(stall_disposition(&config, 1, 3, 3), StallDisposition::Dead);
    }

    #[test]
    fn stall_error_is_prefixed() {
        let msg = stall_error(Some("w-1"), Duration::from_secs(30));
        assert!(msg.starts_with("stalled:"));
        assert!(msg.contains("w-1"));
    }
}
