//! The observer client: follows tracked jobs over the realtime connection
//! and falls back to status polling.
//!
//! Connection lifecycle:
//!
//! ```text
//! load fresh jobs -> connect -> subscribe all -> catch-up poll -> session
//!        ^                                                         |
//!        +--- backoff wait (polling every job) <--- connection lost -+
//! ```
//!
//! Updates from either path go through one apply step: a record that does
//! not supersede the last one seen is ignored, and a terminal state ends
//! tracking of that job (it is unsubscribed and removed from local state),
//! so a terminal state is never overwritten.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use folio_core::job::JobProgress;
use folio_core::messages::{ClientMessage, ServerMessage};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::ObserverConfig;
use crate::error::ObserverError;
use crate::local_state::LocalJobStore;
use crate::status::{StatusClient, SubmittedJob};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Sink = SplitSink<Socket, Message>;

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Realtime,
    Poll,
}

/// What the observer reports to its caller.
#[derive(Debug, Clone, PartialEq)]
pub enum ObserverUpdate {
    /// A realtime connection was confirmed by the server.
    Connected { connection_id: String },
    /// The realtime connection dropped; polling covers the gap.
    Disconnected,
    /// A newer state of a tracked job.
    Job {
        progress: JobProgress,
        source: UpdateSource,
    },
    /// The server no longer knows the job (its record expired).
    Expired { job_id: String },
}

#[derive(Debug, Default)]
struct Watched {
    last: Option<JobProgress>,
    /// Arrival of the last realtime event for this job.
    last_event_at: Option<Instant>,
}

/// How a realtime session ended.
enum SessionEnd {
    /// Every tracked job reached a final state.
    Finished,
    Cancelled,
    Dropped,
}

pub struct ObserverClient {
    config: ObserverConfig,
    status: StatusClient,
    store: LocalJobStore,
    watched: HashMap<String, Watched>,
}

impl ObserverClient {
    pub fn new(config: ObserverConfig, status: StatusClient, store: LocalJobStore) -> Self {
        Self {
            config,
            status,
            store,
            watched: HashMap::new(),
        }
    }

    /// Build the status client and load local state from `config`.
    pub async fn open(config: ObserverConfig) -> Result<Self, ObserverError> {
        let status = StatusClient::new(config.api_url.clone())?;
        let store = LocalJobStore::open(config.state_path.clone(), config.freshness).await?;
        Ok(Self::new(config, status, store))
    }

    pub fn store(&self) -> &LocalJobStore {
        &self.store
    }

    /// Submit a job and persist it for observation.
    pub async fn submit(
        &mut self,
        job_id: Option<&str>,
        payload: &serde_json::Value,
        max_attempts: Option<u32>,
    ) -> Result<SubmittedJob, ObserverError> {
        let submitted = self.status.submit(job_id, payload, max_attempts).await?;
        self.store.track(&submitted.job_id, Utc::now()).await?;
        tracing::info!(
            job_id = %submitted.job_id,
            duplicate = submitted.duplicate,
            "Job submitted"
        );
        Ok(submitted)
    }

    /// Persist a job submitted elsewhere so `run` observes it.
    pub async fn watch(&mut self, job_id: &str) -> Result<(), ObserverError> {
        self.store.track(job_id, Utc::now()).await
    }

    /// Observe every fresh persisted job until all of them are final or
    /// `cancel` fires.
    ///
    /// Only local-state I/O errors end the loop early; connection and
    /// polling failures are retried.
    pub async fn run(
        &mut self,
        updates: mpsc::UnboundedSender<ObserverUpdate>,
        cancel: CancellationToken,
    ) -> Result<(), ObserverError> {
        let mut delay = self.config.reconnect.initial_delay;
        let mut attempt = 0u32;

        loop {
            self.refresh_watched().await?;
            if self.watched.is_empty() {
                tracing::info!("No jobs left to observe");
                return Ok(());
            }
            if cancel.is_cancelled() {
                return Ok(());
            }

            attempt += 1;
            let connected = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                result = connect_async(self.config.ws_url.as_str()) => result,
            };

            match connected {
                Ok((socket, _response)) => {
                    tracing::info!(url = %self.config.ws_url, attempt, "Realtime connection established");
                    attempt = 0;
                    delay = self.config.reconnect.initial_delay;
                    match self.run_session(socket, &updates, &cancel).await? {
                        SessionEnd::Finished | SessionEnd::Cancelled => return Ok(()),
                        SessionEnd::Dropped => {
                            tracing::warn!("Realtime connection lost, falling back to polling");
                            let _ = updates.send(ObserverUpdate::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        attempt,
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "Realtime connect failed",
                    );
                }
            }

            self.wait_offline(delay, &updates, &cancel).await?;
            if cancel.is_cancelled() {
                return Ok(());
            }
            delay = self.config.reconnect.next_delay(delay);
            tracing::info!(attempt = attempt + 1, "Reconnecting to realtime server");
        }
    }

    /// Sync the watch set with the fresh entries of local state.
    async fn refresh_watched(&mut self) -> Result<(), ObserverError> {
        let fresh = self.store.fresh_jobs(Utc::now()).await?;
        let ids: HashSet<&str> = fresh.iter().map(|j| j.job_id.as_str()).collect();
        self.watched.retain(|id, _| ids.contains(id.as_str()));
        for job in &fresh {
            self.watched.entry(job.job_id.clone()).or_default();
        }
        Ok(())
    }

    async fn run_session(
        &mut self,
        socket: Socket,
        updates: &mpsc::UnboundedSender<ObserverUpdate>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, ObserverError> {
        let (mut sink, mut stream) = socket.split();

        // The server's first frame is the connection confirmation.
        let first = tokio::select! {
            _ = cancel.cancelled() => return Ok(SessionEnd::Cancelled),
            frame = stream.next() => frame,
        };
        match first {
            Some(Ok(Message::Text(text))) => {
                self.on_text(&text, updates).await?;
            }
            _ => return Ok(SessionEnd::Dropped),
        }

        let job_ids: Vec<String> = self.watched.keys().cloned().collect();
        for job_id in job_ids {
            tracing::debug!(job_id = %job_id, "Subscribing");
            if !send_client(&mut sink, &ClientMessage::Subscribe { job_id, ack: false }).await {
                return Ok(SessionEnd::Dropped);
            }
        }

        // Events fired before the subscriptions landed are only in the store.
        let finished = self.poll(false, updates).await?;
        if !unsubscribe_all(&mut sink, finished).await {
            return Ok(SessionEnd::Dropped);
        }

        let poll_interval = self.config.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + poll_interval, poll_interval);

        loop {
            if self.watched.is_empty() {
                let _ = sink.close().await;
                return Ok(SessionEnd::Finished);
            }

            let finished = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(SessionEnd::Cancelled);
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.on_text(&text, updates).await?,
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Server closed realtime connection");
                        return Ok(SessionEnd::Dropped);
                    }
                    Some(Ok(_)) => Vec::new(),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Realtime receive error");
                        return Ok(SessionEnd::Dropped);
                    }
                    None => return Ok(SessionEnd::Dropped),
                },
                _ = ticker.tick() => self.poll(true, updates).await?,
            };

            if !unsubscribe_all(&mut sink, finished).await {
                return Ok(SessionEnd::Dropped);
            }
        }
    }

    /// Handle one server frame. Returns jobs that just became final.
    async fn on_text(
        &mut self,
        text: &str,
        updates: &mpsc::UnboundedSender<ObserverUpdate>,
    ) -> Result<Vec<String>, ObserverError> {
        let message = match serde_json::from_str::<ServerMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unparseable server frame");
                return Ok(Vec::new());
            }
        };

        match message {
            ServerMessage::ConnectionConfirmed { connection_id } => {
                tracing::debug!(connection_id = %connection_id, "Connection confirmed");
                let _ = updates.send(ObserverUpdate::Connected { connection_id });
                Ok(Vec::new())
            }
            ServerMessage::JobProgress { progress, .. }
            | ServerMessage::JobCompleted { progress, .. }
            | ServerMessage::JobFailed { progress, .. } => Ok(self
                .handle(progress, UpdateSource::Realtime, updates)
                .await?
                .into_iter()
                .collect()),
            ServerMessage::Subscribed { job_id } | ServerMessage::Unsubscribed { job_id } => {
                tracing::trace!(job_id = %job_id, "Subscription acknowledged");
                Ok(Vec::new())
            }
            ServerMessage::Error { message } => {
                tracing::warn!(message = %message, "Server rejected a frame");
                Ok(Vec::new())
            }
        }
    }

    /// Poll the status interface. With `only_quiet`, jobs that had a
    /// realtime event within the last poll interval are skipped.
    /// Returns jobs that became final or expired.
    async fn poll(
        &mut self,
        only_quiet: bool,
        updates: &mpsc::UnboundedSender<ObserverUpdate>,
    ) -> Result<Vec<String>, ObserverError> {
        let now = Instant::now();
        let quiet_for = self.config.poll_interval;
        let due: Vec<String> = self
            .watched
            .iter()
            .filter(|(_, w)| {
                !only_quiet || w.last_event_at.map_or(true, |t| now.duration_since(t) >= quiet_for)
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut finished = Vec::new();
        for job_id in due {
            match self.status.get_progress(&job_id).await {
                Ok(Some(progress)) => {
                    if let Some(done) = self.handle(progress, UpdateSource::Poll, updates).await? {
                        finished.push(done);
                    }
                }
                Ok(None) => {
                    tracing::warn!(job_id = %job_id, "Job unknown to the server, no longer observing");
                    let _ = updates.send(ObserverUpdate::Expired {
                        job_id: job_id.clone(),
                    });
                    self.forget(&job_id).await?;
                    finished.push(job_id);
                }
                Err(e) => {
                    tracing::warn!(job_id = %job_id, error = %e, "Status poll failed");
                }
            }
        }
        Ok(finished)
    }

    /// Poll every job until `delay` elapses, `cancel` fires, or nothing is
    /// left to observe.
    async fn wait_offline(
        &mut self,
        delay: Duration,
        updates: &mpsc::UnboundedSender<ObserverUpdate>,
        cancel: &CancellationToken,
    ) -> Result<(), ObserverError> {
        let deadline = Instant::now() + delay;
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep_until(deadline) => return Ok(()),
                _ = ticker.tick() => {
                    self.poll(false, updates).await?;
                    if self.watched.is_empty() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Apply an update and stop tracking the job if it is now final.
    async fn handle(
        &mut self,
        progress: JobProgress,
        source: UpdateSource,
        updates: &mpsc::UnboundedSender<ObserverUpdate>,
    ) -> Result<Option<String>, ObserverError> {
        let job_id = progress.job_id.clone();
        if !self.apply(progress, source, updates) {
            return Ok(None);
        }
        tracing::info!(job_id = %job_id, "Job reached a final state");
        self.forget(&job_id).await?;
        Ok(Some(job_id))
    }

    /// Record `progress` if it is newer than what was last seen and report
    /// it. Returns `true` when the job just became final.
    fn apply(
        &mut self,
        progress: JobProgress,
        source: UpdateSource,
        updates: &mpsc::UnboundedSender<ObserverUpdate>,
    ) -> bool {
        let Some(entry) = self.watched.get_mut(&progress.job_id) else {
            return false;
        };
        if source == UpdateSource::Realtime {
            entry.last_event_at = Some(Instant::now());
        }
        if let Some(last) = &entry.last {
            if last.is_terminal() || !progress.supersedes(last) {
                return false;
            }
        }

        let terminal = progress.is_terminal();
        entry.last = Some(progress.clone());
        let _ = updates.send(ObserverUpdate::Job { progress, source });
        terminal
    }

    async fn forget(&mut self, job_id: &str) -> Result<(), ObserverError> {
        self.watched.remove(job_id);
        self.store.remove(job_id).await?;
        Ok(())
    }
}

async fn send_client(sink: &mut Sink, message: &ClientMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => sink.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode client message");
            false
        }
    }
}

async fn unsubscribe_all(sink: &mut Sink, job_ids: Vec<String>) -> bool {
    for job_id in job_ids {
        if !send_client(sink, &ClientMessage::Unsubscribe { job_id, ack: false }).await {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use folio_core::job::JobStatus;

    async fn client_in(dir: &Path) -> ObserverClient {
        let config = ObserverConfig::new(
            "http://127.0.0.1:9/api/v1",
            "ws://127.0.0.1:9/api/v1/ws",
            dir.join("state.json"),
        );
        ObserverClient::open(config).await.unwrap()
    }

    async fn watching(dir: &Path, job_id: &str) -> ObserverClient {
        let mut client = client_in(dir).await;
        client.watch(job_id).await.unwrap();
        client.refresh_watched().await.unwrap();
        client
    }

    #[tokio::test]
    async fn repeated_update_is_reported_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = watching(dir.path(), "j").await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let p = JobProgress::processing("j", 1, 40, "working", Utc::now());
        assert!(!client.apply(p.clone(), UpdateSource::Realtime, &tx));
        assert!(!client.apply(p, UpdateSource::Poll, &tx));

        assert!(matches!(rx.try_recv(), Ok(ObserverUpdate::Job { source: UpdateSource::Realtime, .. })));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn older_update_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = watching(dir.path(), "j").await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let older = JobProgress::processing("j", 1, 10, "early", Utc::now());
        let mut newer = JobProgress::processing("j", 1, 50, "later", Utc::now());
        newer.updated_at = older.updated_at + chrono::Duration::seconds(1);

        client.apply(newer, UpdateSource::Realtime, &tx);
        client.apply(older, UpdateSource::Poll, &tx);

        let ObserverUpdate::Job { progress, .. } = rx.try_recv().unwrap() else {
            panic!("expected a job update");
        };
        assert_eq!(progress.progress, 50);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retry_from_a_lagging_clock_is_still_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = watching(dir.path(), "j").await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let running = JobProgress::processing("j", 1, 70, "working", Utc::now());
        let mut retrying = JobProgress::retrying("j", 1, 3, Duration::ZERO, "stalled: no heartbeat");
        retrying.updated_at = running.updated_at - chrono::Duration::seconds(5);

        client.apply(running, UpdateSource::Realtime, &tx);
        client.apply(retrying, UpdateSource::Realtime, &tx);

        let _ = rx.try_recv().unwrap();
        let ObserverUpdate::Job { progress, .. } = rx.try_recv().unwrap() else {
            panic!("expected a job update");
        };
        assert_eq!(progress.status, JobStatus::Queued);
        assert_eq!(progress.attempt, 1);
    }

    #[tokio::test]
    async fn terminal_state_ends_tracking() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = watching(dir.path(), "j").await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let done = JobProgress::completed("j", 1, "img://j", Utc::now());
        let finished = client.handle(done, UpdateSource::Poll, &tx).await.unwrap();
        assert_eq!(finished.as_deref(), Some("j"));
        assert!(client.store().jobs().is_empty());

        // A late realtime copy of an earlier state changes nothing.
        let late = JobProgress::processing("j", 1, 90, "late", Utc::now());
        assert!(client.handle(late, UpdateSource::Realtime, &tx).await.unwrap().is_none());

        let ObserverUpdate::Job { progress, .. } = rx.try_recv().unwrap() else {
            panic!("expected a job update");
        };
        assert_eq!(progress.status, JobStatus::Completed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn stale_persisted_jobs_are_not_watched() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client_in(dir.path()).await;
        client
            .store
            .track("old", Utc::now() - chrono::Duration::minutes(30))
            .await
            .unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        client.run(tx, CancellationToken::new()).await.unwrap();
        assert!(client.store().jobs().is_empty());
    }
}
