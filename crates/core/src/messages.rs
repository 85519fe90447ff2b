//! Realtime wire messages exchanged between the fan-out server and observers.
//!
//! Every frame is a JSON text message with a `type` tag. Server-to-client
//! job messages carry the full [`JobProgress`] snapshot so a client never
//! needs a second round trip to render an update.

use serde::{Deserialize, Serialize};

use crate::job::JobProgress;
use crate::job_events::{JobEvent, JobEventType};
use crate::types::JobId;

/// Server-to-client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame on every connection.
    ConnectionConfirmed { connection_id: String },
    JobProgress { job_id: JobId, progress: JobProgress },
    JobCompleted { job_id: JobId, progress: JobProgress },
    JobFailed { job_id: JobId, progress: JobProgress },
    /// Acknowledges a `subscribe` that asked for one.
    Subscribed { job_id: JobId },
    /// Acknowledges an `unsubscribe` that asked for one.
    Unsubscribed { job_id: JobId },
    /// The last client frame could not be understood.
    Error { message: String },
}

impl ServerMessage {
    /// The job this message concerns, if any.
    pub fn job_id(&self) -> Option<&str> {
        match self {
            ServerMessage::JobProgress { job_id, .. }
            | ServerMessage::JobCompleted { job_id, .. }
            | ServerMessage::JobFailed { job_id, .. }
            | ServerMessage::Subscribed { job_id }
            | ServerMessage::Unsubscribed { job_id } => Some(job_id),
            ServerMessage::ConnectionConfirmed { .. } | ServerMessage::Error { .. } => None,
        }
    }

    /// The progress snapshot carried by job messages.
    pub fn progress(&self) -> Option<&JobProgress> {
        match self {
            ServerMessage::JobProgress { progress, .. }
            | ServerMessage::JobCompleted { progress, .. }
            | ServerMessage::JobFailed { progress, .. } => Some(progress),
            _ => None,
        }
    }
}

impl From<JobEvent> for ServerMessage {
    fn from(event: JobEvent) -> Self {
        let JobEvent {
            event_type,
            job_id,
            progress,
            ..
        } = event;
        match event_type {
            JobEventType::Progress => ServerMessage::JobProgress { job_id, progress },
            JobEventType::Completed => ServerMessage::JobCompleted { job_id, progress },
            JobEventType::Failed => ServerMessage::JobFailed { job_id, progress },
        }
    }
}

/// Client-to-server messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        job_id: JobId,
        #[serde(default)]
        ack: bool,
    },
    Unsubscribe {
        job_id: JobId,
        #[serde(default)]
        ack: bool,
    },
}
