//! Cross-process event bridge over Postgres `LISTEN/NOTIFY`.
//!
//! Worker processes publish through [`PgEventBridge`]; the fan-out server
//! runs [`relay`], which republishes every notification into its local
//! [`EventBus`]. A single background task issues the `pg_notify` calls, so
//! events from one bridge reach Postgres in publish order.

use std::sync::Arc;
use std::time::Duration;

use folio_core::job::truncate_text;
use folio_core::job_events::JobEvent;
use folio_db::DbPool;
use sqlx::postgres::PgListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, EventPublisher};

/// Notification channel carrying serialized [`JobEvent`]s.
pub const JOB_EVENTS_CHANNEL: &str = "folio_job_events";

/// Pause before retrying a failed listener receive.
const LISTENER_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Postgres rejects `NOTIFY` payloads of this many bytes or more.
const MAX_NOTIFY_PAYLOAD_BYTES: usize = 8000;

/// Budget for each free-text field of an oversized event.
const TRIMMED_TEXT_BYTES: usize = 512;

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Publisher that forwards events to `pg_notify` from a background task.
#[derive(Clone)]
pub struct PgEventBridge {
    sender: mpsc::UnboundedSender<JobEvent>,
}

impl PgEventBridge {
    /// Start the notifier task. It drains pending events and exits when
    /// `cancel` fires or every bridge handle is dropped.
    pub fn spawn(pool: DbPool, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_notifier(pool, receiver, cancel));
        (Self { sender }, handle)
    }
}

impl EventPublisher for PgEventBridge {
    fn publish(&self, event: JobEvent) {
        if let Err(e) = self.sender.send(event) {
            tracing::warn!(job_id = %e.0.job_id, "Event bridge closed, event dropped");
        }
    }
}

async fn run_notifier(
    pool: DbPool,
    mut receiver: mpsc::UnboundedReceiver<JobEvent>,
    cancel: CancellationToken,
) {
    tracing::info!(channel = JOB_EVENTS_CHANNEL, "Event bridge notifier started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Flush what is already queued so terminal events are not lost on shutdown.
                while let Ok(event) = receiver.try_recv() {
                    notify(&pool, &event).await;
                }
                break;
            }
            next = receiver.recv() => match next {
                Some(event) => notify(&pool, &event).await,
                None => break,
            },
        }
    }
    tracing::info!("Event bridge notifier stopped");
}

async fn notify(pool: &DbPool, event: &JobEvent) {
    let payload = match notification_payload(event) {
        Ok(Some(p)) => p,
        Ok(None) => {
            tracing::error!(job_id = %event.job_id, "Job event too large to publish, dropped");
            return;
        }
        Err(e) => {
            tracing::error!(job_id = %event.job_id, error = %e, "Failed to serialize job event");
            return;
        }
    };

    if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
        .bind(JOB_EVENTS_CHANNEL)
        .bind(&payload)
        .execute(pool)
        .await
    {
        tracing::warn!(job_id = %event.job_id, error = %e, "Failed to publish job event");
    }
}

/// Serialize `event` for `pg_notify`, trimming its free text when the full
/// form would not fit. `None` when even the trimmed form is too large.
fn notification_payload(event: &JobEvent) -> Result<Option<String>, serde_json::Error> {
    let payload = serde_json::to_string(event)?;
    if payload.len() < MAX_NOTIFY_PAYLOAD_BYTES {
        return Ok(Some(payload));
    }

    let mut trimmed = event.clone();
    let progress = &mut trimmed.progress;
    progress.message = truncate_text(&progress.message, TRIMMED_TEXT_BYTES);
    progress.error_detail = progress
        .error_detail
        .as_deref()
        .map(|detail| truncate_text(detail, TRIMMED_TEXT_BYTES));
    tracing::debug!(
        job_id = %event.job_id,
        original_bytes = payload.len(),
        "Trimming oversized job event",
    );

    let payload = serde_json::to_string(&trimmed)?;
    Ok((payload.len() < MAX_NOTIFY_PAYLOAD_BYTES).then_some(payload))
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

/// Listen on [`JOB_EVENTS_CHANNEL`] and republish every event into `bus`.
///
/// Runs until `cancel` fires. Returns an error only if the initial
/// `LISTEN` cannot be established; later receive errors are logged and
/// retried (the listener reconnects on its own).
pub async fn relay(
    pool: DbPool,
    bus: Arc<EventBus>,
    cancel: CancellationToken,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(&pool).await?;
    listener.listen(JOB_EVENTS_CHANNEL).await?;
    tracing::info!(channel = JOB_EVENTS_CHANNEL, "Event relay listening");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Event relay stopping");
                return Ok(());
            }
            received = listener.recv() => match received {
                Ok(notification) => {
                    match serde_json::from_str::<JobEvent>(notification.payload()) {
                        Ok(event) => bus.publish(event),
                        Err(e) => tracing::warn!(error = %e, "Ignoring malformed job event"),
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Event relay receive failed, retrying");
                    tokio::time::sleep(LISTENER_RETRY_DELAY).await;
                }
            },
        }
    }
}
