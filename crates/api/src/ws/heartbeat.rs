//! Keep-alive pings for observers idling in job rooms.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::ws::manager::WsManager;

/// Period between pings.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Ping every open connection once per `period` until `cancel` fires.
/// Ticks with no connections are skipped.
pub async fn run_heartbeat(ws_manager: Arc<WsManager>, period: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let count = ws_manager.connection_count().await;
                if count == 0 {
                    continue;
                }
                tracing::trace!(count, "Pinging WebSocket connections");
                ws_manager.ping_all().await;
            }
        }
    }
    tracing::debug!("WebSocket heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::ws::Message;

    #[tokio::test(start_paused = true)]
    async fn pings_once_per_period_until_cancelled() {
        let manager = Arc::new(WsManager::new());
        let mut rx = manager.add("conn-1".into()).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_heartbeat(
            manager.clone(),
            Duration::from_secs(30),
            cancel.clone(),
        ));

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(matches!(rx.try_recv(), Ok(Message::Ping(_))));
        assert!(rx.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert!(rx.try_recv().is_err());
    }
}
