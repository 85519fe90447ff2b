//! Progress callback handed to the generation routine.
//!
//! Reports go into an unbounded channel that the owning worker drains in
//! order, turning each one into exactly one progress-store write and one
//! event publish.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use folio_core::job::clamp_percent;
use tokio::sync::mpsc;

/// One `(percent, message)` report after clamping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
}

/// Send-only progress handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<ProgressUpdate>,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    /// Create a reporter and the receiver the worker drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ProgressUpdate>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = Self {
            sender,
            high_water: Arc::new(AtomicU8::new(0)),
        };
        (reporter, receiver)
    }

    /// Report progress.
    ///
    /// `percent` is clamped to `0..=100` and never drops below the highest
    /// value reported so far. Returns the percent actually recorded.
    /// Reporting after the worker stopped listening is a silent no-op.
    pub fn report(&self, percent: i64, message: impl Into<String>) -> u8 {
        let clamped = clamp_percent(percent);
        let previous = self.high_water.fetch_max(clamped, Ordering::SeqCst);
        let effective = previous.max(clamped);

        let update = ProgressUpdate {
            percent: effective,
            message: message.into(),
        };
        if self.sender.send(update).is_err() {
            tracing::trace!(percent = effective, "Progress reported after worker stopped listening");
        }
        effective
    }

    /// Highest percent reported so far.
    pub fn current(&self) -> u8 {
        self.high_water.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_arrive_in_order() {
        let (reporter, mut rx) = ProgressReporter::channel();
        reporter.report(10, "a");
        reporter.report(40, "b");
        drop(reporter);

        assert_eq!(rx.recv().await.unwrap().percent, 10);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.percent, 40);
        assert_eq!(second.message, "b");
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn clamps_out_of_range_values() {
        let (reporter, _rx) = ProgressReporter::channel();
        assert_eq!(reporter.report(-20, "negative"), 0);
        assert_eq!(reporter.report(250, "too high"), 100);
    }

    #[test]
    fn never_lowers_percent() {
        let (reporter, mut rx) = ProgressReporter::channel();
        reporter.report(60, "ahead");
        assert_eq!(reporter.report(30, "behind"), 60);
        assert_eq!(reporter.current(), 60);

        rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(second.percent, 60);
        assert_eq!(second.message, "behind");
    }

    #[test]
    fn clones_share_high_water_mark() {
        let (reporter, _rx) = ProgressReporter::channel();
        let other = reporter.clone();
        reporter.report(70, "x");
        assert_eq!(other.report(10, "y"), 70);
    }

    #[test]
    fn report_after_receiver_dropped_is_harmless() {
        let (reporter, rx) = ProgressReporter::channel();
        drop(rx);
        assert_eq!(reporter.report(50, "late"), 50);
    }
}
