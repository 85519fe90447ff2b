//! Queue housekeeping loops.
//!
//! Each loop is a long-running async function intended to be spawned via
//! `tokio::spawn`, ticking on a fixed `tokio::time::interval` until its
//! [`CancellationToken`] fires. A failed cycle is logged and retried on the
//! next tick.

use std::sync::Arc;
use std::time::Duration;

use folio_core::job::JobProgress;
use folio_db::{RetentionPolicy, StallDisposition, StalledJob};
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::service::JobService;

// ---------------------------------------------------------------------------
// StallWatchdog
// ---------------------------------------------------------------------------

/// Detects claims whose worker stopped heartbeating and requeues or fails
/// them, surfacing the outcome as a progress update.
pub struct StallWatchdog {
    service: Arc<JobService>,
    stall_timeout: Duration,
    check_interval: Duration,
}

impl StallWatchdog {
    pub fn new(service: Arc<JobService>, stall_timeout: Duration, check_interval: Duration) -> Self {
        Self {
            service,
            stall_timeout,
            check_interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            stall_timeout_secs = self.stall_timeout.as_secs(),
            interval_secs = self.check_interval.as_secs(),
            "Stall watchdog started"
        );

        let mut interval = tokio::time::interval(self.check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Stall watchdog stopping");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.check_once().await {
                        tracing::error!(error = %e, "Stall check failed");
                    }
                }
            }
        }
    }

    /// One watchdog pass. Returns the jobs that were found stalled.
    ///
    /// A requeued job is released for claiming only after its retrying
    /// record is written, so the next owner's updates always land on top.
    pub async fn check_once(&self) -> Result<Vec<StalledJob>, WorkerError> {
        let stalled = self.service.queue().reap_stalled(self.stall_timeout).await?;
        for s in &stalled {
            self.surface(s).await?;
            if s.disposition == StallDisposition::Requeued {
                self.service.queue().release(&s.job.job_id).await?;
            }
        }
        Ok(stalled)
    }

    async fn surface(&self, stalled: &StalledJob) -> Result<(), WorkerError> {
        let job = &stalled.job;

        let progress = match stalled.disposition {
            StallDisposition::Requeued => {
                tracing::warn!(
                    job_id = %job.job_id,
                    attempt = job.attempts,
                    stall_count = job.stall_count,
                    "Stalled job requeued",
                );
                JobProgress::retrying(
                    &job.job_id,
                    job.attempts,
                    job.max_attempts,
                    Duration::ZERO,
                    &stalled.error,
                )
            }
            StallDisposition::Dead => {
                tracing::error!(
                    job_id = %job.job_id,
                    attempts = job.attempts,
                    stall_count = job.stall_count,
                    "Stalled job failed permanently",
                );
                let last = self.service.tracker().get(&job.job_id).await?;
                JobProgress::failed(
                    &job.job_id,
                    job.attempts,
                    last.as_ref().map_or(0, |p| p.progress),
                    &stalled.error,
                    last.as_ref().and_then(|p| p.started_at),
                )
            }
        };

        self.service.update(progress).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RetentionSweeper
// ---------------------------------------------------------------------------

/// Prunes terminal jobs beyond the retention bounds and purges expired
/// progress entries.
pub struct RetentionSweeper {
    service: Arc<JobService>,
    policy: RetentionPolicy,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(service: Arc<JobService>, policy: RetentionPolicy, interval: Duration) -> Self {
        Self {
            service,
            policy,
            interval,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!(
            keep_completed = self.policy.keep_completed,
            keep_failed = self.policy.keep_failed,
            max_age_secs = self.policy.max_age.as_secs(),
            interval_secs = self.interval.as_secs(),
            "Retention sweeper started"
        );

        let mut interval = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Retention sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    match self.sweep_once().await {
                        Ok((0, 0)) => tracing::debug!("Retention: nothing to purge"),
                        Ok((jobs, progress)) => {
                            tracing::info!(jobs, progress, "Retention: purged old entries");
                        }
                        Err(e) => tracing::error!(error = %e, "Retention: sweep failed"),
                    }
                }
            }
        }
    }

    /// One sweep. Returns `(jobs pruned, progress entries purged)`.
    pub async fn sweep_once(&self) -> Result<(u64, u64), WorkerError> {
        let jobs = self.service.queue().prune(&self.policy).await?;
        let progress = self.service.tracker().purge_expired().await?;
        Ok((jobs, progress))
    }
}
