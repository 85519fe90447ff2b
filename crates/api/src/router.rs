//! Router for the fan-out server.
//!
//! [`build_app_router`] is shared by `main.rs` and the integration tests so
//! both serve through the same middleware.

use std::time::Duration;

use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, Method, StatusCode};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::{parse_cors_origins, ServerConfig};
use crate::routes;
use crate::state::AppState;

/// Build the application [`Router`].
///
/// ```text
/// /health                           liveness and queue reachability
/// /api/v1/ws                        WebSocket upgrade into job rooms
/// /api/v1/jobs                      submit
/// /api/v1/jobs/{job_id}/progress    latest progress
/// /api/v1/queue/stats               queue counters
/// ```
///
/// Layers, outermost first: CORS, request id, tracing, request id
/// propagation, timeout, panic recovery. For `/api/v1/ws` the timeout only
/// covers the upgrade handshake; the socket runs on its own task.
pub fn build_app_router(state: AppState, config: &ServerConfig) -> Router {
    let request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .merge(routes::health::router())
        .nest("/api/v1", routes::api_routes())
        .layer(CatchPanicLayer::new())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(config.request_timeout_secs),
        ))
        .layer(PropagateRequestIdLayer::new(request_id.clone()))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(SetRequestIdLayer::new(request_id, MakeRequestUuid))
        .layer(build_cors_layer(config))
        .with_state(state)
}

/// CORS for browser observers: JSON `GET` and `POST` only.
///
/// [`ServerConfig::from_env`] rejects unparseable origins. A hand-built
/// config carrying one gets a layer that allows no cross-origin requests.
pub fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let origins = parse_cors_origins(&config.cors_origins).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Ignoring CORS origins");
        Vec::new()
    });

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600))
}
