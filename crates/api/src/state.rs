use std::sync::Arc;

use folio_worker::JobService;

use crate::config::ServerConfig;
use crate::ws::WsManager;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// WebSocket connections and job rooms.
    pub ws_manager: Arc<WsManager>,
    /// Submit / status / stats over the shared queue and progress store.
    pub jobs: Arc<JobService>,
}
