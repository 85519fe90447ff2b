//! Job lifecycle events carried on the event bridge.
//!
//! A [`JobEvent`] is transient: it is published by the worker that owns the
//! job, forwarded to the realtime server, and never persisted. The progress
//! store stays authoritative.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::job::{JobProgress, JobStatus};
use crate::types::{JobId, Timestamp};

/// Realtime message type for a progress update.
pub const MSG_TYPE_JOB_PROGRESS: &str = "job_progress";

/// Realtime message type for a completed job.
pub const MSG_TYPE_JOB_COMPLETED: &str = "job_completed";

/// Realtime message type for a terminally failed job.
pub const MSG_TYPE_JOB_FAILED: &str = "job_failed";

/// Kind of lifecycle change an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventType {
    Progress,
    Completed,
    Failed,
}

impl JobEventType {
    /// The realtime message type observers receive for this event.
    pub fn message_type(self) -> &'static str {
        match self {
            JobEventType::Progress => MSG_TYPE_JOB_PROGRESS,
            JobEventType::Completed => MSG_TYPE_JOB_COMPLETED,
            JobEventType::Failed => MSG_TYPE_JOB_FAILED,
        }
    }
}

/// Wire form of a job lifecycle change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    #[serde(rename = "type")]
    pub event_type: JobEventType,
    pub job_id: JobId,
    /// Snapshot of the progress record as written to the store.
    pub progress: JobProgress,
    pub timestamp: Timestamp,
}

impl JobEvent {
    /// Build the event matching a freshly written progress record.
    ///
    /// Terminal statuses map to `completed` / `failed`; everything else is
    /// a `progress` event.
    pub fn from_progress(progress: JobProgress) -> Self {
        let event_type = match progress.status {
            JobStatus::Completed => JobEventType::Completed,
            JobStatus::Failed => JobEventType::Failed,
            JobStatus::Queued | JobStatus::Processing => JobEventType::Progress,
        };
        Self {
            event_type,
            job_id: progress.job_id.clone(),
            progress,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_follows_status() {
        let started = Utc::now();
        let e = JobEvent::from_progress(JobProgress::processing("a", 1, 40, "working", started));
        assert_eq!(e.event_type, JobEventType::Progress);

        let e = JobEvent::from_progress(JobProgress::completed("a", 1, "img://a", started));
        assert_eq!(e.event_type, JobEventType::Completed);

        let e = JobEvent::from_progress(JobProgress::failed("a", 3, 10, "boom", Some(started)));
        assert_eq!(e.event_type, JobEventType::Failed);
        assert_eq!(e.job_id, "a");
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let e = JobEvent::from_progress(JobProgress::queued("abc"));
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["job_id"], "abc");
        assert_eq!(json["progress"]["status"], "queued");
    }
}
