//! Client-local record of submitted jobs.
//!
//! The file holds `{job_id, submitted_at}` pairs and nothing else; it exists
//! only so a restarted observer can pick up jobs that were in flight. It is
//! rewritten whole (write to a sibling temp file, then rename) on every
//! change.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ObserverError;

/// One persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedJob {
    pub job_id: String,
    pub submitted_at: DateTime<Utc>,
}

impl TrackedJob {
    pub fn is_fresh(&self, now: DateTime<Utc>, freshness: Duration) -> bool {
        match chrono::Duration::from_std(freshness) {
            Ok(window) => now - self.submitted_at <= window,
            Err(_) => true,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    jobs: Vec<TrackedJob>,
}

pub struct LocalJobStore {
    path: PathBuf,
    freshness: Duration,
    jobs: Vec<TrackedJob>,
}

impl LocalJobStore {
    /// Load the store at `path`. A missing file is an empty store; an
    /// unreadable one is logged and replaced on the next write.
    pub async fn open(path: impl Into<PathBuf>, freshness: Duration) -> Result<Self, ObserverError> {
        let path = path.into();
        let jobs = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<StateFile>(&bytes) {
                Ok(file) => file.jobs,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Discarding corrupt observer state");
                    Vec::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            freshness,
            jobs,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every persisted entry, fresh or not.
    pub fn jobs(&self) -> &[TrackedJob] {
        &self.jobs
    }

    /// Record a submitted job. Re-tracking an id keeps the first timestamp.
    pub async fn track(
        &mut self,
        job_id: &str,
        submitted_at: DateTime<Utc>,
    ) -> Result<(), ObserverError> {
        if self.jobs.iter().any(|j| j.job_id == job_id) {
            return Ok(());
        }
        self.jobs.push(TrackedJob {
            job_id: job_id.to_string(),
            submitted_at,
        });
        self.save().await
    }

    /// Forget a job. Returns whether it was tracked.
    pub async fn remove(&mut self, job_id: &str) -> Result<bool, ObserverError> {
        let before = self.jobs.len();
        self.jobs.retain(|j| j.job_id != job_id);
        if self.jobs.len() == before {
            return Ok(false);
        }
        self.save().await?;
        Ok(true)
    }

    /// Drop entries outside the freshness window and return the rest.
    pub async fn fresh_jobs(&mut self, now: DateTime<Utc>) -> Result<Vec<TrackedJob>, ObserverError> {
        let before = self.jobs.len();
        let freshness = self.freshness;
        self.jobs.retain(|j| j.is_fresh(now, freshness));
        let discarded = before - self.jobs.len();
        if discarded > 0 {
            tracing::info!(discarded, "Discarded stale persisted jobs");
            self.save().await?;
        }
        Ok(self.jobs.clone())
    }

    async fn save(&self) -> Result<(), ObserverError> {
        let bytes = serde_json::to_vec_pretty(&StateFile {
            jobs: self.jobs.clone(),
        })?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}
