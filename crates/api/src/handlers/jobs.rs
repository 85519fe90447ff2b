//! Handlers for the `/jobs` resource: submission and status queries.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use folio_core::error::CoreError;
use folio_core::job::EnqueueOptions;
use folio_db::EnqueueOutcome;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::AppResult;
use crate::response::DataResponse;
use crate::state::AppState;

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

/// Request body for POST /jobs.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitJobRequest {
    /// Caller-chosen id; a UUID v4 is assigned when omitted.
    #[validate(length(min = 1, max = 128))]
    pub job_id: Option<String>,
    /// Opaque generation payload handed to the worker as-is.
    #[serde(default)]
    pub payload: serde_json::Value,
    #[validate(range(min = 1, max = 20))]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: String,
    /// `true` when the id was already queued and nothing was enqueued.
    pub duplicate: bool,
}

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

/// POST /api/v1/jobs
///
/// Enqueue a job. Returns 202 once the job is queued and its `queued`
/// progress record exists. Resubmitting an id is a no-op reported with
/// `duplicate: true`.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(input): Json<SubmitJobRequest>,
) -> AppResult<impl IntoResponse> {
    input
        .validate()
        .map_err(|e| CoreError::Validation(e.to_string()))?;

    let job_id = input
        .job_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let options = input.max_attempts.map(EnqueueOptions::with_max_attempts);

    let outcome = state.jobs.submit(&job_id, input.payload, options).await?;

    let data = SubmitJobResponse {
        job_id,
        duplicate: outcome == EnqueueOutcome::Duplicate,
    };
    Ok((StatusCode::ACCEPTED, Json(DataResponse { data })))
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// GET /api/v1/jobs/{job_id}/progress
///
/// Latest progress record. 404 when the job is unknown or its record has
/// expired.
pub async fn get_progress(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> AppResult<impl IntoResponse> {
    let progress = state.jobs.get_progress(&job_id).await?;
    Ok(Json(DataResponse { data: progress }))
}
