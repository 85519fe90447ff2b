//! Job and progress records.
//!
//! [`Job`] is the queue's unit of work; [`JobProgress`] is the latest
//! known status of a job as seen by observers. Progress records are
//! written only by the worker currently holding the job's claim.

use std::cmp::Ordering;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{JobId, Timestamp};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default number of attempts a job gets before it is dead.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Upper bound accepted for `max_attempts` on submission.
pub const MAX_ATTEMPTS_LIMIT: u32 = 20;

/// Maximum length of a job identifier.
const MAX_JOB_ID_LEN: usize = 128;

/// Prefix carried by `error_detail` when a job was presumed dead by the
/// stall watchdog.
pub const STALLED_ERROR_PREFIX: &str = "stalled";

/// Message shown on the terminal failure of a job that exhausted its
/// attempts. The last attempt's error is kept in `error_detail`.
pub const GENERIC_FAILURE_MESSAGE: &str = "Image generation failed";

// ---------------------------------------------------------------------------
// JobStatus
// ---------------------------------------------------------------------------

/// Lifecycle status of a job as exposed to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// `Completed` and `Failed` are final: nothing is written after them.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// JobProgress
// ---------------------------------------------------------------------------

/// Latest known state of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Completion percentage, always within `0..=100`.
    pub progress: u8,
    pub message: String,
    /// Reference to the produced artifact (set on completion).
    pub result_ref: Option<String>,
    pub error_detail: Option<String>,
    /// 1-based attempt number this record belongs to (0 before the first claim).
    #[serde(default)]
    pub attempt: u32,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub updated_at: Timestamp,
}

impl JobProgress {
    /// The record seeded into the store when a job is enqueued.
    pub fn queued(job_id: impl Into<JobId>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            message: "Waiting in queue".to_string(),
            result_ref: None,
            error_detail: None,
            attempt: 0,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn processing(
        job_id: impl Into<JobId>,
        attempt: u32,
        percent: u8,
        message: impl Into<String>,
        started_at: Timestamp,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Processing,
            progress: percent.min(100),
            message: message.into(),
            result_ref: None,
            error_detail: None,
            attempt,
            started_at: Some(started_at),
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn completed(
        job_id: impl Into<JobId>,
        attempt: u32,
        result_ref: impl Into<String>,
        started_at: Timestamp,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status: JobStatus::Completed,
            progress: 100,
            message: "Generation complete".to_string(),
            result_ref: Some(result_ref.into()),
            error_detail: None,
            attempt,
            started_at: Some(started_at),
            completed_at: Some(now),
            updated_at: now,
        }
    }

    /// Terminal failure. `progress` keeps whatever the last attempt reached.
    pub fn failed(
        job_id: impl Into<JobId>,
        attempt: u32,
        progress: u8,
        error_detail: impl Into<String>,
        started_at: Option<Timestamp>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            status: JobStatus::Failed,
            progress: progress.min(100),
            message: GENERIC_FAILURE_MESSAGE.to_string(),
            result_ref: None,
            error_detail: Some(error_detail.into()),
            attempt,
            started_at,
            completed_at: Some(now),
            updated_at: now,
        }
    }

    /// A failed attempt that the queue will run again.
    ///
    /// Recorded as `Queued` so that `Failed` stays terminal; the attempt's
    /// error is still visible through `error_detail`.
    pub fn retrying(
        job_id: impl Into<JobId>,
        failed_attempt: u32,
        max_attempts: u32,
        retry_in: std::time::Duration,
        error_detail: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Queued,
            progress: 0,
            message: format!(
                "Attempt {failed_attempt} of {max_attempts} failed, retrying in {}s",
                retry_in.as_secs()
            ),
            result_ref: None,
            error_detail: Some(error_detail.into()),
            attempt: failed_attempt,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether this record describes a later state of the job than `other`.
    ///
    /// Records are written by different processes, so they are ordered by
    /// attempt, phase within the attempt and percent; `updated_at` only
    /// breaks ties.
    pub fn supersedes(&self, other: &JobProgress) -> bool {
        match self.lifecycle_key().cmp(&other.lifecycle_key()) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => self.updated_at > other.updated_at,
        }
    }

    fn lifecycle_key(&self) -> (u32, u8, u8) {
        let phase = match self.status {
            JobStatus::Processing => 1,
            // Past the seed (attempt 0), a queued record closes a failed attempt.
            JobStatus::Queued => 2,
            JobStatus::Completed | JobStatus::Failed => 3,
        };
        (self.attempt, phase, self.progress)
    }
}

/// Clamp an arbitrary reported percentage into `0..=100`.
pub fn clamp_percent(percent: i64) -> u8 {
    percent.clamp(0, 100) as u8
}

/// Longest `error_detail` recorded for a failed attempt, in bytes.
pub const MAX_ERROR_DETAIL_BYTES: usize = 1024;

const TRUNCATION_MARKER: &str = "...";

/// Cut `text` to at most `max_bytes` on a char boundary. A cut is marked
/// with a trailing `...` that counts towards the limit.
pub fn truncate_text(text: &str, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text.to_string();
    }
    let mut end = max_bytes.saturating_sub(TRUNCATION_MARKER.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}{TRUNCATION_MARKER}", &text[..end])
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// A queued unit of work. The payload is opaque to the queue and immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub payload: serde_json::Value,
    /// Attempts started so far (incremented on claim).
    pub attempts: u32,
    pub max_attempts: u32,
    /// How many times the stall watchdog has requeued this job.
    pub stall_count: u32,
    pub created_at: Timestamp,
}

/// Per-submission options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub max_attempts: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl EnqueueOptions {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self { max_attempts }
    }

    /// Reject option values outside the accepted range.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.max_attempts == 0 || self.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(CoreError::Validation(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT}"
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a job identifier.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_JOB_ID_LEN` characters.
/// - Only ASCII alphanumerics, hyphen, underscore, dot, or colon.
pub fn validate_job_id(job_id: &str) -> Result<(), CoreError> {
    if job_id.is_empty() {
        return Err(CoreError::Validation(
            "Job id must not be empty".to_string(),
        ));
    }
    if job_id.len() > MAX_JOB_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Job id must not exceed {MAX_JOB_ID_LEN} characters"
        )));
    }
    if !job_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
    {
        return Err(CoreError::Validation(
            "Job id may only contain alphanumeric, hyphen, underscore, dot, or colon characters"
                .to_string(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::time::Duration;

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::Processing).unwrap();
        assert_eq!(json, "\"processing\"");
        let back: JobStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(back, JobStatus::Completed);
    }

    #[test]
    fn later_phase_wins_regardless_of_clock() {
        let started = Utc::now();
        let mut running = JobProgress::processing("a", 1, 60, "working", started);
        let mut retrying = JobProgress::retrying("a", 1, 3, Duration::from_secs(5), "boom");
        // Written on a host whose clock runs behind.
        retrying.updated_at = running.updated_at - chrono::Duration::seconds(10);
        assert!(retrying.supersedes(&running));
        assert!(!running.supersedes(&retrying));

        running.attempt = 2;
        running.progress = 0;
        running.updated_at = retrying.updated_at - chrono::Duration::seconds(10);
        assert!(running.supersedes(&retrying));
    }

    #[test]
    fn timestamp_breaks_ties_within_a_phase() {
        let started = Utc::now();
        let first = JobProgress::processing("a", 1, 0, "Generation started", started);
        let mut second = JobProgress::processing("a", 1, 0, "warming up", started);
        second.updated_at = first.updated_at + chrono::Duration::milliseconds(5);
        assert!(second.supersedes(&first));
        assert!(!first.supersedes(&second));
        assert!(!first.supersedes(&first));
    }

    #[test]
    fn short_text_is_kept_whole() {
        assert_eq!(truncate_text("upstream down", 64), "upstream down");
    }

    #[test]
    fn long_text_is_cut_on_a_char_boundary() {
        let text = "é".repeat(600);
        let cut = truncate_text(&text, 101);
        assert!(cut.len() <= 101);
        assert!(cut.ends_with("..."));
        assert!(cut.trim_end_matches("...").chars().all(|c| c == 'é'));
    }

    #[test]
    fn queued_record_starts_at_zero() {
        let p = JobProgress::queued("abc");
        assert_eq!(p.status, JobStatus::Queued);
        assert_eq!(p.progress, 0);
        assert_eq!(p.attempt, 0);
        assert!(p.result_ref.is_none());
    }

    #[test]
    fn completed_record_is_full_and_carries_result() {
        let p = JobProgress::completed("abc", 1, "img://abc", Utc::now());
        assert_eq!(p.progress, 100);
        assert_eq!(p.result_ref.as_deref(), Some("img://abc"));
        assert!(p.completed_at.is_some());
        assert!(p.is_terminal());
    }

    #[test]
    fn retrying_record_is_not_terminal() {
        let p = JobProgress::retrying("abc", 1, 3, Duration::from_secs(5), "boom");
        assert_eq!(p.status, JobStatus::Queued);
        assert_eq!(p.error_detail.as_deref(), Some("boom"));
        assert!(p.message.contains("Attempt 1 of 3"));
        assert!(!p.is_terminal());
    }

    #[test]
    fn clamp_percent_bounds() {
        assert_eq!(clamp_percent(-5), 0);
        assert_eq!(clamp_percent(42), 42);
        assert_eq!(clamp_percent(250), 100);
    }

    #[test]
    fn validate_job_id_accepts_common_forms() {
        assert!(validate_job_id("abc").is_ok());
        assert!(validate_job_id("page-12_theme.v2:cover").is_ok());
        assert!(validate_job_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }

    #[test]
    fn validate_job_id_rejects_bad_input() {
        assert_matches!(validate_job_id(""), Err(CoreError::Validation(_)));
        assert_matches!(validate_job_id("has space"), Err(CoreError::Validation(_)));
        assert_matches!(validate_job_id(&"x".repeat(129)), Err(CoreError::Validation(_)));
    }

    #[test]
    fn enqueue_options_range() {
        assert!(EnqueueOptions::default().validate().is_ok());
        assert_matches!(
            EnqueueOptions::with_max_attempts(0).validate(),
            Err(CoreError::Validation(_))
        );
        assert_matches!(
            EnqueueOptions::with_max_attempts(MAX_ATTEMPTS_LIMIT + 1).validate(),
            Err(CoreError::Validation(_))
        );
    }
}
