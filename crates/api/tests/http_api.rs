//! HTTP surface: submission, status queries, queue stats and health.

mod common;

use std::time::Duration;

use axum::http::StatusCode;
use common::{body_json, get, post_json, TestApp, TEST_PROGRESS_TTL};
use serde_json::json;

// ---------------------------------------------------------------------------
// Submit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_returns_accepted_and_seeds_queued_progress() {
    let app = TestApp::new();

    let response = post_json(
        app.router(),
        "/api/v1/jobs",
        json!({ "job_id": "abc", "payload": { "prompt": "a cat" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["job_id"], "abc");
    assert_eq!(json["data"]["duplicate"], false);

    let response = get(app.router(), "/api/v1/jobs/abc/progress").await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "queued");
    assert_eq!(json["data"]["progress"], 0);
}

#[tokio::test]
async fn duplicate_submit_is_a_no_op() {
    let app = TestApp::new();
    let body = json!({ "job_id": "dup", "payload": {} });

    let first = post_json(app.router(), "/api/v1/jobs", body.clone()).await;
    let second = post_json(app.router(), "/api/v1/jobs", body).await;

    assert_eq!(first.status(), StatusCode::ACCEPTED);
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(second).await["data"]["duplicate"], true);

    let stats = app.jobs.stats().await.unwrap();
    assert_eq!(stats.waiting, 1);
}

#[tokio::test]
async fn submit_without_id_assigns_uuid() {
    let app = TestApp::new();

    let response = post_json(app.router(), "/api/v1/jobs", json!({ "payload": {} })).await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let json = body_json(response).await;
    let job_id = json["data"]["job_id"].as_str().unwrap();
    assert_eq!(job_id.len(), 36);
    assert!(app.jobs.get_progress(job_id).await.is_ok());
}

#[tokio::test]
async fn submit_rejects_invalid_input() {
    let app = TestApp::new();

    let bad_id = post_json(
        app.router(),
        "/api/v1/jobs",
        json!({ "job_id": "has spaces", "payload": {} }),
    )
    .await;
    assert_eq!(bad_id.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(bad_id).await["code"], "VALIDATION_ERROR");

    let bad_attempts = post_json(
        app.router(),
        "/api/v1/jobs",
        json!({ "job_id": "ok", "max_attempts": 0 }),
    )
    .await;
    assert_eq!(bad_attempts.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(bad_attempts).await["code"], "VALIDATION_ERROR");
}

// ---------------------------------------------------------------------------
// Progress
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_job_progress_is_404() {
    let app = TestApp::new();

    let response = get(app.router(), "/api/v1/jobs/nope/progress").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json = body_json(response).await;
    assert_eq!(json["code"], "NOT_FOUND");
    assert!(json["error"].as_str().unwrap().contains("nope"));
}

#[tokio::test(start_paused = true)]
async fn progress_is_gone_after_ttl() {
    let app = TestApp::new();
    app.jobs.submit("short-lived", json!({}), None).await.unwrap();

    tokio::time::advance(TEST_PROGRESS_TTL - Duration::from_secs(1)).await;
    let response = get(app.router(), "/api/v1/jobs/short-lived/progress").await;
    assert_eq!(response.status(), StatusCode::OK);

    tokio::time::advance(Duration::from_secs(2)).await;
    let response = get(app.router(), "/api/v1/jobs/short-lived/progress").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Stats and health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_stats_counts_waiting_jobs() {
    let app = TestApp::new();
    for id in ["a", "b", "c"] {
        app.jobs.submit(id, json!({}), None).await.unwrap();
    }

    let response = get(app.router(), "/api/v1/queue/stats").await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["waiting"], 3);
    assert_eq!(json["data"]["active"], 0);
    assert_eq!(json["data"]["completed"], 0);
    assert_eq!(json["data"]["failed"], 0);
}

#[tokio::test]
async fn health_reports_ok_with_request_id() {
    let app = TestApp::new();

    let response = get(app.router(), "/health").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["queue_healthy"], true);
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn unknown_route_returns_404() {
    let app = TestApp::new();
    let response = get(app.router(), "/this-route-does-not-exist").await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
