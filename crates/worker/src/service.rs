//! The job service: one explicitly constructed object holding the queue,
//! the progress tracker and the event publisher.
//!
//! Submission, status queries, the worker pool and the maintenance loops
//! all go through a shared `Arc<JobService>`, so tests can assemble the
//! whole pipeline from in-memory backends.

use std::sync::Arc;

use folio_core::error::CoreError;
use folio_core::job::{validate_job_id, EnqueueOptions, JobProgress};
use folio_core::job_events::JobEvent;
use folio_db::{EnqueueOutcome, JobQueue, ProgressTracker, QueueStats, StoreError};
use folio_events::EventPublisher;

use crate::error::WorkerError;

pub struct JobService {
    queue: Arc<dyn JobQueue>,
    tracker: ProgressTracker,
    publisher: Arc<dyn EventPublisher>,
    default_options: EnqueueOptions,
}

impl JobService {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        tracker: ProgressTracker,
        publisher: Arc<dyn EventPublisher>,
        default_options: EnqueueOptions,
    ) -> Self {
        Self {
            queue,
            tracker,
            publisher,
            default_options,
        }
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    pub fn default_options(&self) -> EnqueueOptions {
        self.default_options
    }

    /// Submit a job. Idempotent on `job_id`.
    ///
    /// A new job gets its `Queued` progress record seeded before this
    /// returns; a duplicate leaves both the queue and the record untouched.
    /// No event is published for the seed.
    pub async fn submit(
        &self,
        job_id: &str,
        payload: serde_json::Value,
        options: Option<EnqueueOptions>,
    ) -> Result<EnqueueOutcome, WorkerError> {
        validate_job_id(job_id)?;
        let options = options.unwrap_or(self.default_options);
        options.validate()?;

        let outcome = self.queue.enqueue(job_id, payload, options).await?;
        match outcome {
            EnqueueOutcome::Enqueued => {
                self.tracker.record(&JobProgress::queued(job_id)).await?;
                tracing::info!(job_id, max_attempts = options.max_attempts, "Job enqueued");
            }
            EnqueueOutcome::Duplicate => {
                tracing::info!(job_id, "Duplicate submission ignored");
            }
        }
        Ok(outcome)
    }

    /// Latest progress of a job, or `NotFound` when unknown or expired.
    pub async fn get_progress(&self, job_id: &str) -> Result<JobProgress, WorkerError> {
        self.tracker
            .get(job_id)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound {
                    entity: "Job",
                    id: job_id.to_string(),
                }
                .into()
            })
    }

    pub async fn stats(&self) -> Result<QueueStats, WorkerError> {
        Ok(self.queue.stats().await?)
    }

    /// Record an observable state change: one store write, then one publish.
    ///
    /// The publish is skipped if the write fails, so an event never
    /// advertises a state the store does not hold.
    pub async fn update(&self, progress: JobProgress) -> Result<(), StoreError> {
        self.tracker.record(&progress).await?;
        self.publisher.publish(JobEvent::from_progress(progress));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use folio_core::job::JobStatus;
    use folio_core::job_events::JobEventType;
    use folio_db::{MemoryJobQueue, MemoryProgressStore};
    use folio_events::EventBus;
    use serde_json::json;

    fn service() -> (JobService, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let service = JobService::new(
            Arc::new(MemoryJobQueue::default()),
            ProgressTracker::new(Arc::new(MemoryProgressStore::new()), Duration::from_secs(3600)),
            bus.clone(),
            EnqueueOptions::default(),
        );
        (service, bus)
    }

    #[tokio::test]
    async fn submit_seeds_queued_progress() {
        let (service, _bus) = service();
        let outcome = service.submit("abc", json!({"prompt": "cat"}), None).await.unwrap();
        assert_eq!(outcome, EnqueueOutcome::Enqueued);

        let progress = service.get_progress("abc").await.unwrap();
        assert_eq!(progress.status, JobStatus::Queued);
        assert_eq!(progress.progress, 0);
    }

    #[tokio::test]
    async fn duplicate_submit_keeps_one_job_and_one_record() {
        let (service, _bus) = service();
        service.submit("abc", json!({}), None).await.unwrap();

        // Move the record forward so a re-seed would be visible.
        service
            .update(JobProgress::processing("abc", 1, 30, "working", chrono::Utc::now()))
            .await
            .unwrap();

        let again = service.submit("abc", json!({}), None).await.unwrap();
        assert_eq!(again, EnqueueOutcome::Duplicate);
        assert_eq!(service.stats().await.unwrap().waiting, 1);
        assert_eq!(service.get_progress("abc").await.unwrap().progress, 30);
    }

    #[tokio::test]
    async fn submit_rejects_invalid_input() {
        let (service, _bus) = service();
        assert_matches!(
            service.submit("bad id", json!({}), None).await,
            Err(WorkerError::Core(CoreError::Validation(_)))
        );
        assert_matches!(
            service
                .submit("ok", json!({}), Some(EnqueueOptions::with_max_attempts(0)))
                .await,
            Err(WorkerError::Core(CoreError::Validation(_)))
        );
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (service, _bus) = service();
        assert_matches!(
            service.get_progress("missing").await,
            Err(WorkerError::Core(CoreError::NotFound { .. }))
        );
    }

    #[tokio::test]
    async fn update_writes_then_publishes() {
        let (service, bus) = service();
        let mut rx = bus.subscribe();

        service
            .update(JobProgress::completed("abc", 1, "img://abc", chrono::Utc::now()))
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type, JobEventType::Completed);
        assert_eq!(
            service.get_progress("abc").await.unwrap().result_ref.as_deref(),
            Some("img://abc")
        );
    }
}
