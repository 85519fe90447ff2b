//! HTTP client for the submission and status-query endpoints.

use std::time::Duration;

use folio_core::job::JobProgress;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::ObserverError;

/// Per-request timeout of status calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    code: String,
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubmittedJob {
    pub job_id: String,
    /// The id was already queued; nothing new was enqueued.
    pub duplicate: bool,
}

#[derive(Debug, Clone)]
pub struct StatusClient {
    http: reqwest::Client,
    base_url: String,
}

impl StatusClient {
    /// `base_url` is the API root including the version prefix, e.g.
    /// `http://host:3000/api/v1`.
    pub fn new(base_url: impl Into<String>) -> Result<Self, ObserverError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    /// Submit a job. `job_id: None` lets the server assign one.
    pub async fn submit(
        &self,
        job_id: Option<&str>,
        payload: &serde_json::Value,
        max_attempts: Option<u32>,
    ) -> Result<SubmittedJob, ObserverError> {
        let body = serde_json::json!({
            "job_id": job_id,
            "payload": payload,
            "max_attempts": max_attempts,
        });
        let response = self
            .http
            .post(format!("{}/jobs", self.base_url))
            .json(&body)
            .send()
            .await?;
        read_data(response).await
    }

    /// Latest progress of a job, `None` when the server does not know it
    /// (never submitted, or its record expired).
    pub async fn get_progress(&self, job_id: &str) -> Result<Option<JobProgress>, ObserverError> {
        let response = self
            .http
            .get(format!("{}/jobs/{job_id}/progress", self.base_url))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        read_data(response).await.map(Some)
    }
}

async fn read_data<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ObserverError> {
    let status = response.status();
    if status.is_success() {
        let envelope: DataResponse<T> = response.json().await?;
        return Ok(envelope.data);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.code, body.error),
        Err(_) => ("UNKNOWN".to_string(), text),
    };
    Err(ObserverError::Api {
        status: status.as_u16(),
        code,
        message,
    })
}
