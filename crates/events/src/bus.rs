//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`EventBus`] is shared via `Arc<EventBus>`: workers publish
//! [`JobEvent`]s, the fan-out server's forwarder subscribes.

use folio_core::job_events::JobEvent;
use tokio::sync::broadcast;

// ---------------------------------------------------------------------------
// EventPublisher
// ---------------------------------------------------------------------------

/// Publishing side of the event bridge.
///
/// `publish` must not block the caller meaningfully and never fails: a
/// delivery problem is logged and the event is dropped.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: JobEvent);
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Events from one publisher reach every subscriber in publish order.
///
/// ```rust
/// use folio_core::job::JobProgress;
/// use folio_core::job_events::JobEvent;
/// use folio_events::{EventBus, EventPublisher};
///
/// let bus = EventBus::default();
/// let mut rx = bus.subscribe();
///
/// bus.publish(JobEvent::from_progress(JobProgress::queued("abc")));
/// ```
pub struct EventBus {
    sender: broadcast::Sender<JobEvent>,
}

impl EventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are dropped
    /// and slow receivers will observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventPublisher for EventBus {
    fn publish(&self, event: JobEvent) {
        // A SendError only means there are zero receivers.
        if self.sender.send(event).is_err() {
            tracing::trace!("Event published with no bus subscribers");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::job::JobProgress;
    use folio_core::job_events::JobEventType;

    fn event(job_id: &str, percent: u8) -> JobEvent {
        JobEvent::from_progress(JobProgress::processing(
            job_id,
            1,
            percent,
            "working",
            chrono::Utc::now(),
        ))
    }

    #[tokio::test]
    async fn publish_and_receive_single_subscriber() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(event("abc", 40));

        let received = rx.recv().await.expect("should receive the event");
        assert_eq!(received.job_id, "abc");
        assert_eq!(received.event_type, JobEventType::Progress);
        assert_eq!(received.progress.progress, 40);
    }

    #[tokio::test]
    async fn multiple_subscribers_receive_same_event() {
        let bus = EventBus::default();
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(event("multi", 10));

        let e1 = rx1.recv().await.expect("subscriber 1 should receive");
        let e2 = rx2.recv().await.expect("subscriber 2 should receive");
        assert_eq!(e1.job_id, "multi");
        assert_eq!(e2.job_id, "multi");
    }

    #[tokio::test]
    async fn events_arrive_in_publish_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        for p in [10, 40, 90, 100] {
            bus.publish(event("abc", p));
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(rx.recv().await.unwrap().progress.progress);
        }
        assert_eq!(seen, vec![10, 40, 90, 100]);
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for p in 0..5 {
            bus.publish(event("abc", p));
        }

        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert_eq!(rx.recv().await.unwrap().progress.progress, 3);
    }

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(event("orphan", 0));
    }
}
