//! HTTP adapter for an external image-generation provider.
//!
//! `POST {url}` with the job payload as JSON body; the provider answers
//! `{ "result_ref": "..." }`. The request carries its own timeout, which is
//! the only timeout on a generation attempt.

use std::time::Duration;

use async_trait::async_trait;
use folio_core::job::{truncate_text, MAX_ERROR_DETAIL_BYTES};
use serde::Deserialize;

use crate::generator::{GenerationError, GenerationOutput, Generator};
use crate::reporter::ProgressReporter;

/// Default per-request timeout.
pub const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct ProviderResponse {
    result_ref: Option<String>,
}

/// [`Generator`] backed by a single provider endpoint.
pub struct HttpGenerator {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpGenerator {
    /// Create a generator posting to `url` with the given request timeout.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, url, timeout))
    }

    /// Reuse an existing [`reqwest::Client`]. `timeout` is only used for
    /// error reporting; the client's own timeout applies.
    pub fn with_client(client: reqwest::Client, url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            url: url.into(),
            timeout,
        }
    }

    fn map_request_error(&self, e: reqwest::Error) -> GenerationError {
        if e.is_timeout() {
            GenerationError::Timeout(self.timeout)
        } else {
            GenerationError::Request(e.to_string())
        }
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn execute(
        &self,
        payload: &serde_json::Value,
        progress: ProgressReporter,
    ) -> Result<GenerationOutput, GenerationError> {
        if !payload.is_object() {
            return Err(GenerationError::InvalidPayload(
                "payload must be a JSON object".to_string(),
            ));
        }

        progress.report(10, "Request sent to provider");
        let response = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| self.map_request_error(e))?;

        let status = response.status();
        if !status.is_success() {
            // Error pages can be large; only the head is worth recording.
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(GenerationError::ProviderStatus {
                status: status.as_u16(),
                body: truncate_text(&body, MAX_ERROR_DETAIL_BYTES),
            });
        }

        progress.report(90, "Provider responded");
        let body: ProviderResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::InvalidResponse(e.to_string()))?;

        match body.result_ref {
            Some(result_ref) if !result_ref.is_empty() => Ok(GenerationOutput { result_ref }),
            _ => Err(GenerationError::InvalidResponse(
                "missing result_ref".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/generate")
    }

    #[tokio::test]
    async fn success_returns_result_ref_and_reports_progress() {
        let url = serve(Router::new().route(
            "/generate",
            post(|Json(body): Json<serde_json::Value>| async move {
                Json(json!({ "result_ref": format!("img://{}", body["prompt"].as_str().unwrap_or("")) }))
            }),
        ))
        .await;

        let generator = HttpGenerator::new(url, Duration::from_secs(5)).unwrap();
        let (reporter, mut rx) = ProgressReporter::channel();
        let output = generator
            .execute(&json!({ "prompt": "cat" }), reporter)
            .await
            .unwrap();

        assert_eq!(output.result_ref, "img://cat");
        assert_eq!(rx.recv().await.unwrap().percent, 10);
        assert_eq!(rx.recv().await.unwrap().percent, 90);
    }

    #[tokio::test]
    async fn provider_error_status_is_surfaced() {
        let url = serve(Router::new().route(
            "/generate",
            post(|| async { (StatusCode::BAD_GATEWAY, "upstream down") }),
        ))
        .await;

        let generator = HttpGenerator::new(url, Duration::from_secs(5)).unwrap();
        let (reporter, _rx) = ProgressReporter::channel();
        let err = generator
            .execute(&json!({ "prompt": "cat" }), reporter)
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::ProviderStatus { status: 502, ref body } if body == "upstream down");
    }

    #[tokio::test]
    async fn large_error_page_is_cut_down() {
        let url = serve(Router::new().route(
            "/generate",
            post(|| async { (StatusCode::BAD_GATEWAY, "<html>".repeat(2000)) }),
        ))
        .await;

        let generator = HttpGenerator::new(url, Duration::from_secs(5)).unwrap();
        let (reporter, _rx) = ProgressReporter::channel();
        let err = generator
            .execute(&json!({ "prompt": "cat" }), reporter)
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::ProviderStatus { status: 502, ref body } => {
            assert!(body.len() <= MAX_ERROR_DETAIL_BYTES);
            assert!(body.starts_with("<html><html>"));
            assert!(body.ends_with("..."));
        });
    }

    #[tokio::test]
    async fn slow_provider_times_out() {
        let url = serve(Router::new().route(
            "/generate",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({ "result_ref": "late" }))
            }),
        ))
        .await;

        let generator = HttpGenerator::new(url, Duration::from_millis(100)).unwrap();
        let (reporter, _rx) = ProgressReporter::channel();
        let err = generator
            .execute(&json!({ "prompt": "cat" }), reporter)
            .await
            .unwrap_err();

        assert_matches!(err, GenerationError::Timeout(_));
    }

    #[tokio::test]
    async fn missing_result_ref_is_invalid_response() {
        let url = serve(Router::new().route(
            "/generate",
            post(|| async { Json(json!({ "status": "ok" })) }),
        ))
        .await;

        let generator = HttpGenerator::new(url, Duration::from_secs(5)).unwrap();
        let (reporter, _rx) = ProgressReporter::channel();
        let err = generator.execute(&json!({}), reporter).await.unwrap_err();
        assert_matches!(err, GenerationError::InvalidResponse(_));
    }

    #[tokio::test]
    async fn non_object_payload_is_rejected_without_a_request() {
        let generator =
            HttpGenerator::new("http://127.0.0.1:9/unused", Duration::from_secs(1)).unwrap();
        let (reporter, _rx) = ProgressReporter::channel();
        let err = generator.execute(&json!("just a string"), reporter).await.unwrap_err();
        assert_matches!(err, GenerationError::InvalidPayload(_));
    }
}
