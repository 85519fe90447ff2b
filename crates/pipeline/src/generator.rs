use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::reporter::ProgressReporter;

/// What a successful generation produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationOutput {
    /// Opaque reference to the stored artifact.
    pub result_ref: String,
}

impl GenerationOutput {
    pub fn new(result_ref: impl Into<String>) -> Self {
        Self {
            result_ref: result_ref.into(),
        }
    }
}

/// A failed generation attempt.
///
/// Never fatal to the worker: it becomes the attempt's `error_detail` and
/// the job is retried or failed by the queue.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    /// The payload cannot be turned into a generation request.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The provider could not be reached or the request failed in transit.
    #[error("Provider request failed: {0}")]
    Request(String),

    /// The provider answered with a non-2xx status.
    #[error("Provider error ({status}): {body}")]
    ProviderStatus { status: u16, body: String },

    /// The provider answered 2xx but the body was not understood.
    #[error("Invalid provider response: {0}")]
    InvalidResponse(String),

    #[error("Generation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// Any other failure raised by the routine.
    #[error("{0}")]
    Failed(String),
}

/// The generation routine.
///
/// `execute` may call `progress.report` zero or more times. It occupies one
/// worker slot for its whole duration.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn execute(
        &self,
        payload: &serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<GenerationOutput, GenerationError>;
}
