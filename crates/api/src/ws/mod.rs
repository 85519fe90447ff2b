//! WebSocket fan-out: connection management with per-job rooms, heartbeat
//! pings, and the HTTP upgrade handler used by Axum routes.

mod handler;
mod heartbeat;
pub mod manager;

pub use handler::ws_handler;
pub use heartbeat::{run_heartbeat, HEARTBEAT_INTERVAL};
pub use manager::{text_frame, WsManager};
