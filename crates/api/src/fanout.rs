//! Bridge-to-room forwarding.
//!
//! [`EventForwarder`] is the fan-out server's single subscriber on the
//! event bridge. Each [`JobEvent`] becomes a realtime message emitted to
//! the room named after its job id. Events are forwarded one at a time, so
//! per-job publish order is preserved on every connection.

use std::sync::Arc;

use folio_core::job_events::JobEvent;
use folio_core::messages::ServerMessage;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::ws::{text_frame, WsManager};

pub struct EventForwarder {
    ws_manager: Arc<WsManager>,
}

impl EventForwarder {
    pub fn new(ws_manager: Arc<WsManager>) -> Self {
        Self { ws_manager }
    }

    /// Run the forwarding loop until `cancel` fires or the bus closes.
    pub async fn run(self, mut receiver: broadcast::Receiver<JobEvent>, cancel: CancellationToken) {
        tracing::info!("Event forwarder started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Event forwarder stopping");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => {
                        self.forward(event).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Observers recover the skipped states by polling.
                        tracing::warn!(skipped = n, "Event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, event forwarder shutting down");
                        break;
                    }
                },
            }
        }
    }

    /// Emit one event to its job room. Returns the number of recipients.
    pub async fn forward(&self, event: JobEvent) -> usize {
        let job_id = event.job_id.clone();
        let message_type = event.event_type.message_type();
        let frame = match text_frame(&ServerMessage::from(event)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to encode job event");
                return 0;
            }
        };

        let delivered = self.ws_manager.emit_to_room(&job_id, frame).await;
        if delivered == 0 {
            tracing::debug!(job_id = %job_id, message_type, "No subscribers for job event");
        } else {
            tracing::trace!(job_id = %job_id, message_type, delivered, "Job event forwarded");
        }
        delivered
    }
}
