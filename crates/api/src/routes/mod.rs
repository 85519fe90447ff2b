pub mod health;
pub mod jobs;
pub mod queue;

use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::ws;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /ws                          WebSocket (job rooms)
///
/// /jobs                        submit (POST)
/// /jobs/{job_id}/progress      latest progress (GET)
///
/// /queue/stats                 queue counts (GET)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .nest("/jobs", jobs::router())
        .nest("/queue", queue::router())
}
