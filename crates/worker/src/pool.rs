//! The worker pool: N execution slots pulling from the job queue.
//!
//! Each slot loops claim -> execute. Generation errors, timeouts and panics
//! become failed attempts; only a [`StoreError`](folio_db::StoreError)
//! escapes a slot, and it stops the whole pool.
//!
//! Within one attempt the queue transition (ack / nack) always happens
//! before the matching terminal progress write, so a worker whose claim
//! was taken over never writes a final state.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use folio_core::job::{truncate_text, JobProgress, MAX_ERROR_DETAIL_BYTES};
use folio_db::{Claim, ClaimedJob, JobQueue, NackOutcome};
use folio_pipeline::{GenerationError, GenerationOutput, Generator, ProgressReporter, ProgressUpdate};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::WorkerError;
use crate::service::JobService;

/// Default number of execution slots.
pub const DEFAULT_CONCURRENCY: usize = 2;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub concurrency: usize,
    /// Longest idle wait between claim attempts.
    pub poll_interval: Duration,
    /// Claim heartbeat period while a job runs.
    pub heartbeat_interval: Duration,
    /// Prefix of slot identifiers.
    pub worker_name: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            poll_interval: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            worker_name: "worker".to_string(),
        }
    }
}

pub struct WorkerPool {
    service: Arc<JobService>,
    generator: Arc<dyn Generator>,
    config: PoolConfig,
}

impl WorkerPool {
    pub fn new(service: Arc<JobService>, generator: Arc<dyn Generator>, config: PoolConfig) -> Self {
        Self {
            service,
            generator,
            config,
        }
    }

    /// Run every slot until `cancel` fires or a slot fails.
    ///
    /// Slots finish the job they are executing before stopping. The first
    /// slot error cancels the remaining slots and is returned.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let slot_cancel = cancel.child_token();
        let mut slots = JoinSet::new();

        for index in 0..self.config.concurrency.max(1) {
            let slot = Slot {
                id: format!("{}-{index}", self.config.worker_name),
                service: Arc::clone(&self.service),
                generator: Arc::clone(&self.generator),
                poll_interval: self.config.poll_interval,
                heartbeat_interval: self.config.heartbeat_interval,
            };
            slots.spawn(slot.run(slot_cancel.clone()));
        }
        tracing::info!(concurrency = self.config.concurrency, "Worker pool started");

        let mut first_error = None;
        while let Some(joined) = slots.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(WorkerError::SlotAborted {
                    slot: "unknown".into(),
                    reason: e.to_string(),
                })
            });
            if let Err(e) = result {
                if first_error.is_none() {
                    tracing::error!(error = %e, "Worker slot failed, stopping pool");
                    slot_cancel.cancel();
                    first_error = Some(e);
                }
            }
        }

        tracing::info!("Worker pool stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Slot
// ---------------------------------------------------------------------------

struct Slot {
    id: String,
    service: Arc<JobService>,
    generator: Arc<dyn Generator>,
    poll_interval: Duration,
    heartbeat_interval: Duration,
}

/// How an attempt ended, from the slot's point of view.
enum Execution {
    Finished(Result<GenerationOutput, GenerationError>),
    ClaimLost,
}

impl Slot {
    fn queue(&self) -> &Arc<dyn JobQueue> {
        self.service.queue()
    }

    async fn run(self, cancel: CancellationToken) -> Result<(), WorkerError> {
        tracing::debug!(slot = %self.id, "Worker slot started");
        while !cancel.is_cancelled() {
            match self.queue().claim(&self.id).await? {
                Some(claimed) => self.process(claimed).await?,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        waited = self.queue().wait_for_work(self.poll_interval) => waited?,
                    }
                }
            }
        }
        tracing::debug!(slot = %self.id, "Worker slot stopped");
        Ok(())
    }

    /// Run one attempt of a claimed job through the execution pipeline.
    async fn process(&self, claimed: ClaimedJob) -> Result<(), WorkerError> {
        let ClaimedJob { job, claim } = claimed;
        let started_at = Utc::now();
        tracing::info!(
            job_id = %job.job_id,
            slot = %self.id,
            attempt = claim.attempt,
            max_attempts = job.max_attempts,
            "Job claimed",
        );

        self.service
            .update(JobProgress::processing(
                &job.job_id,
                claim.attempt,
                0,
                "Generation started",
                started_at,
            ))
            .await?;

        let (reporter, updates) = ProgressReporter::channel();
        let generator = Arc::clone(&self.generator);
        let payload = job.payload.clone();
        let task = tokio::spawn(async move { generator.execute(&payload, reporter).await });

        let mut last_percent = 0;
        let execution = self
            .supervise(&claim, started_at, task, updates, &mut last_percent)
            .await?;

        let result = match execution {
            Execution::Finished(result) => result,
            Execution::ClaimLost => {
                tracing::warn!(
                    job_id = %job.job_id,
                    slot = %self.id,
                    "Claim lost while running, abandoning attempt",
                );
                return Ok(());
            }
        };

        match result {
            Ok(output) => {
                if !self.queue().ack(&claim).await? {
                    tracing::warn!(job_id = %job.job_id, "Claim lost before ack, result discarded");
                    return Ok(());
                }
                self.service
                    .update(JobProgress::completed(
                        &job.job_id,
                        claim.attempt,
                        &output.result_ref,
                        started_at,
                    ))
                    .await?;
                tracing::info!(
                    job_id = %job.job_id,
                    result_ref = %output.result_ref,
                    "Job completed",
                );
            }
            Err(e) => {
                let detail = truncate_text(&e.to_string(), MAX_ERROR_DETAIL_BYTES);
                match self.queue().nack(&claim, &detail).await? {
                    NackOutcome::Retrying { attempt, delay } => {
                        tracing::warn!(
                            job_id = %job.job_id,
                            attempt,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %detail,
                            "Attempt failed, retrying",
                        );
                        self.service
                            .update(JobProgress::retrying(
                                &job.job_id,
                                attempt,
                                job.max_attempts,
                                delay,
                                detail,
                            ))
                            .await?;
                    }
                    NackOutcome::Dead { attempts } => {
                        tracing::error!(
                            job_id = %job.job_id,
                            attempts,
                            error = %detail,
                            "Job failed permanently",
                        );
                        self.service
                            .update(JobProgress::failed(
                                &job.job_id,
                                attempts,
                                last_percent,
                                detail,
                                Some(started_at),
                            ))
                            .await?;
                    }
                    NackOutcome::ClaimLost => {
                        tracing::warn!(job_id = %job.job_id, "Claim lost before nack, failure discarded");
                    }
                }
            }
        }
        Ok(())
    }

    /// Drive the generation task: forward its progress reports in order,
    /// heartbeat the claim, and collect its result.
    async fn supervise(
        &self,
        claim: &Claim,
        started_at: chrono::DateTime<Utc>,
        mut task: tokio::task::JoinHandle<Result<GenerationOutput, GenerationError>>,
        mut updates: mpsc::UnboundedReceiver<ProgressUpdate>,
        last_percent: &mut u8,
    ) -> Result<Execution, WorkerError> {
        let mut heartbeat = tokio::time::interval_at(
            tokio::time::Instant::now() + self.heartbeat_interval,
            self.heartbeat_interval,
        );

        let joined = loop {
            tokio::select! {
                biased;
                Some(update) = updates.recv() => {
                    if !self.forward(claim, started_at, update, last_percent).await? {
                        task.abort();
                        return Ok(Execution::ClaimLost);
                    }
                }
                joined = &mut task => break joined,
                _ = heartbeat.tick() => {
                    if !self.queue().heartbeat(claim).await? {
                        task.abort();
                        return Ok(Execution::ClaimLost);
                    }
                }
            }
        };

        // The reporter is dropped with the task; drain what it sent last.
        while let Ok(update) = updates.try_recv() {
            if !self.forward(claim, started_at, update, last_percent).await? {
                return Ok(Execution::ClaimLost);
            }
        }

        Ok(Execution::Finished(joined.unwrap_or_else(|e| Err(join_failure(e)))))
    }

    /// Heartbeat, then write and publish one progress report.
    /// Returns `false` when the claim is no longer ours.
    async fn forward(
        &self,
        claim: &Claim,
        started_at: chrono::DateTime<Utc>,
        update: ProgressUpdate,
        last_percent: &mut u8,
    ) -> Result<bool, WorkerError> {
        if !self.queue().heartbeat(claim).await? {
            return Ok(false);
        }
        *last_percent = update.percent;
        self.service
            .update(JobProgress::processing(
                &claim.job_id,
                claim.attempt,
                update.percent,
                update.message,
                started_at,
            ))
            .await?;
        Ok(true)
    }
}

fn join_failure(e: JoinError) -> GenerationError {
    if e.is_panic() {
        GenerationError::Failed("generation routine panicked".to_string())
    } else {
        GenerationError::Failed(format!("generation routine aborted: {e}"))
    }
}
