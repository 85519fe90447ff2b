use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use folio_core::job::{EnqueueOptions, Job};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{
    nack_outcome, stall_disposition, stall_error, Claim, ClaimedJob, EnqueueOutcome, JobQueue,
    NackOutcome, QueueConfig, QueueStats, RetentionPolicy, StallDisposition, StalledJob,
    STALL_REQUEUE_HOLD,
};
use crate::error::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Waiting,
    Active,
    Completed,
    Failed,
}

#[derive(Debug)]
struct Entry {
    job: Job,
    seq: u64,
    state: State,
    ready_at: Instant,
    heartbeat_at: Instant,
    claim_token: Option<Uuid>,
    worker_id: Option<String>,
    last_error: Option<String>,
    finished_at: Option<Instant>,
}

impl Entry {
    fn owned_by(&self, claim: &Claim) -> bool {
        self.state == State::Active && self.claim_token == Some(claim.token)
    }

    fn finish(&mut self, state: State, now: Instant) {
        self.state = state;
        self.finished_at = Some(now);
        self.claim_token = None;
    }
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<String, Entry>,
    next_seq: u64,
}

impl Inner {
    fn earliest_ready_at(&self) -> Option<Instant> {
        self.jobs
            .values()
            .filter(|e| e.state == State::Waiting)
            .map(|e| e.ready_at)
            .min()
    }
}

/// Process-local queue for tests and single-process deployments.
///
/// All state sits behind one mutex, which makes `claim` trivially atomic.
/// Idle workers park on a [`Notify`] that enqueue and requeue paths wake.
pub struct MemoryJobQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    config: QueueConfig,
}

impl Default for MemoryJobQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MemoryJobQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            config,
        }
    }

    /// Snapshot of a job, in any state.
    pub async fn job(&self, job_id: &str) -> Option<Job> {
        self.inner.lock().await.jobs.get(job_id).map(|e| e.job.clone())
    }

    /// Error recorded by the most recent failed attempt or stall.
    pub async fn last_error(&self, job_id: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .jobs
            .get(job_id)
            .and_then(|e| e.last_error.clone())
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn enqueue(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        options: EnqueueOptions,
    ) -> Result<EnqueueOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        if inner.jobs.contains_key(job_id) {
            return Ok(EnqueueOutcome::Duplicate);
        }

        let now = Instant::now();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            job_id.to_string(),
            Entry {
                job: Job {
                    job_id: job_id.to_string(),
                    payload,
                    attempts: 0,
                    max_attempts: options.max_attempts,
                    stall_count: 0,
                    created_at: Utc::now(),
                },
                seq,
                state: State::Waiting,
                ready_at: now,
                heartbeat_at: now,
                claim_token: None,
                worker_id: None,
                last_error: None,
                finished_at: None,
            },
        );
        drop(inner);

        self.notify.notify_waiters();
        Ok(EnqueueOutcome::Enqueued)
    }

    async fn claim(&self, worker_id: &str) -> Result<Option<ClaimedJob>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let next = inner
            .jobs
            .values()
            .filter(|e| e.state == State::Waiting && e.ready_at <= now)
            .min_by_key(|e| (e.ready_at, e.seq))
            .map(|e| e.job.job_id.clone());
        let Some(job_id) = next else {
            return Ok(None);
        };
        let Some(entry) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };

        let token = Uuid::new_v4();
        entry.state = State::Active;
        entry.job.attempts += 1;
        entry.claim_token = Some(token);
        entry.worker_id = Some(worker_id.to_string());
        entry.heartbeat_at = now;

        Ok(Some(ClaimedJob {
            job: entry.job.clone(),
            claim: Claim {
                job_id,
                token,
                attempt: entry.job.attempts,
            },
        }))
    }

    async fn wait_for_work(&self, max_wait: Duration) -> Result<(), StoreError> {
        // Register interest before inspecting state so an enqueue racing
        // with this call is not missed.
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let deadline = {
            let inner = self.inner.lock().await;
            let now = Instant::now();
            match inner.earliest_ready_at() {
                Some(at) if at <= now => return Ok(()),
                Some(at) => at.min(now + max_wait),
                None => now + max_wait,
            }
        };

        let _ = tokio::time::timeout_at(deadline, notified).await;
        Ok(())
    }

    async fn heartbeat(&self, claim: &Claim) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&claim.job_id) {
            Some(entry) if entry.owned_by(claim) => {
                entry.heartbeat_at = Instant::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ack(&self, claim: &Claim) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(&claim.job_id) {
            Some(entry) if entry.owned_by(claim) => {
                entry.finish(State::Completed, Instant::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn nack(&self, claim: &Claim, error: &str) -> Result<NackOutcome, StoreError> {
        let mut inner = self.inner.lock().await;
        let entry = match inner.jobs.get_mut(&claim.job_id) {
            Some(entry) if entry.owned_by(claim) => entry,
            _ => return Ok(NackOutcome::ClaimLost),
        };

        let now = Instant::now();
        let outcome = nack_outcome(&self.config, entry.job.attempts, entry.job.max_attempts);
        entry.last_error = Some(error.to_string());
        match outcome {
            NackOutcome::Retrying { delay, .. } => {
                entry.state = State::Waiting;
                entry.ready_at = now + delay;
                entry.claim_token = None;
            }
            NackOutcome::Dead { .. } => entry.finish(State::Failed, now),
            NackOutcome::ClaimLost => {}
        }
        drop(inner);

        if matches!(outcome, NackOutcome::Retrying { .. }) {
            // Sleeping workers recompute their deadline from the new ready_at.
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    async fn reap_stalled(&self, stall_timeout: Duration) -> Result<Vec<StalledJob>, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let mut stalled = Vec::new();

        for entry in inner.jobs.values_mut() {
            if entry.state != State::Active || entry.heartbeat_at + stall_timeout > now {
                continue;
            }

            entry.job.stall_count += 1;
            let error = stall_error(entry.worker_id.as_deref(), stall_timeout);
            let disposition = stall_disposition(
                &self.config,
                entry.job.stall_count,
                entry.job.attempts,
                entry.job.max_attempts,
            );
            entry.last_error = Some(error.clone());
            match disposition {
                StallDisposition::Requeued => {
                    entry.state = State::Waiting;
                    entry.ready_at = now + STALL_REQUEUE_HOLD;
                    entry.claim_token = None;
                }
                StallDisposition::Dead => entry.finish(State::Failed, now),
            }

            stalled.push(StalledJob {
                job: entry.job.clone(),
                error,
                disposition,
            });
        }
        Ok(stalled)
    }

    async fn release(&self, job_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let Some(entry) = inner.jobs.get_mut(job_id) else {
            return Ok(false);
        };
        if entry.state != State::Waiting {
            return Ok(false);
        }
        entry.ready_at = entry.ready_at.min(Instant::now());
        drop(inner);

        self.notify.notify_waiters();
        Ok(true)
    }

    async fn prune(&self, policy: &RetentionPolicy) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let before = inner.jobs.len();

        let mut doomed = Vec::new();
        for (state, keep) in [
            (State::Completed, policy.keep_completed),
            (State::Failed, policy.keep_failed),
        ] {
            let mut finished: Vec<(&String, Instant)> = inner
                .jobs
                .iter()
                .filter(|(_, e)| e.state == state)
                .map(|(id, e)| (id, e.finished_at.unwrap_or(now)))
                .collect();
            // Newest first.
            finished.sort_by(|a, b| b.1.cmp(&a.1));

            for (rank, (id, finished_at)) in finished.into_iter().enumerate() {
                if rank >= keep || now.duration_since(finished_at) > policy.max_age {
                    doomed.push(id.clone());
                }
            }
        }

        for id in doomed {
            inner.jobs.remove(&id);
        }
        Ok((before - inner.jobs.len()) as u64)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let inner = self.inner.lock().await;
        let now = Instant::now();
        let mut stats = QueueStats::default();
        for entry in inner.jobs.values() {
            match entry.state {
                State::Waiting if entry.ready_at <= now => stats.waiting += 1,
                State::Waiting => stats.delayed += 1,
                State::Active => stats.active += 1,
                State::Completed => stats.completed += 1,
                State::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }
}
