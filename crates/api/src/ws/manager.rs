use std::collections::{HashMap, HashSet};

use axum::body::Bytes;
use axum::extract::ws::Message;
use folio_core::messages::ServerMessage;
use folio_core::types::Timestamp;
use tokio::sync::{mpsc, RwLock};

/// Channel sender half for pushing messages to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

/// Metadata for a single WebSocket connection.
pub struct WsConnection {
    /// Channel sender for outbound messages to this connection.
    pub sender: WsSender,
    /// When this connection was established.
    pub connected_at: Timestamp,
    /// Rooms (job ids) this connection is subscribed to.
    pub rooms: HashSet<String>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<String, WsConnection>,
    /// job id -> connection ids. Empty rooms are removed.
    rooms: HashMap<String, HashSet<String>>,
}

/// Manages all active WebSocket connections and their job rooms.
///
/// Connections and room membership live behind one `RwLock`, so a
/// connection is never in a room it is not registered for. Designed to be
/// wrapped in `Arc` and shared across the application.
pub struct WsManager {
    registry: RwLock<Registry>,
}

impl WsManager {
    /// Create a new, empty connection manager.
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Register a new connection.
    ///
    /// Returns the receiver half of the message channel so the caller can
    /// forward messages to the WebSocket sink.
    pub async fn add(&self, conn_id: String) -> mpsc::UnboundedReceiver<Message> {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = WsConnection {
            sender: tx,
            connected_at: chrono::Utc::now(),
            rooms: HashSet::new(),
        };
        self.registry.write().await.connections.insert(conn_id, conn);
        rx
    }

    /// Remove a connection and drop it from every room it joined.
    /// Other room members are not notified.
    pub async fn remove(&self, conn_id: &str) {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.remove(conn_id) else {
            return;
        };
        for job_id in &conn.rooms {
            leave(&mut registry.rooms, job_id, conn_id);
        }
        tracing::debug!(
            conn_id,
            rooms = conn.rooms.len(),
            connected_secs = (chrono::Utc::now() - conn.connected_at).num_seconds(),
            "Connection removed from rooms"
        );
    }

    /// Add a connection to room `job_id`.
    ///
    /// Returns `false` if the connection is not registered. Joining a room
    /// twice is a no-op.
    pub async fn subscribe(&self, conn_id: &str, job_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let Some(conn) = registry.connections.get_mut(conn_id) else {
            return false;
        };
        conn.rooms.insert(job_id.to_string());
        registry
            .rooms
            .entry(job_id.to_string())
            .or_default()
            .insert(conn_id.to_string());
        true
    }

    /// Remove a connection from room `job_id`. Returns whether it was a member.
    pub async fn unsubscribe(&self, conn_id: &str, job_id: &str) -> bool {
        let mut registry = self.registry.write().await;
        let was_member = registry
            .connections
            .get_mut(conn_id)
            .is_some_and(|conn| conn.rooms.remove(job_id));
        if was_member {
            leave(&mut registry.rooms, job_id, conn_id);
        }
        was_member
    }

    /// Send a message to every connection in room `job_id`.
    ///
    /// Returns the number of connections the message was queued for; `0`
    /// when nobody is subscribed.
    pub async fn emit_to_room(&self, job_id: &str, message: Message) -> usize {
        let registry = self.registry.read().await;
        let Some(members) = registry.rooms.get(job_id) else {
            return 0;
        };
        let mut count = 0;
        for conn_id in members {
            if let Some(conn) = registry.connections.get(conn_id) {
                if conn.sender.send(message.clone()).is_ok() {
                    count += 1;
                }
            }
        }
        count
    }

    /// Send a message to a single connection. Returns `false` if it is gone.
    pub async fn send_to(&self, conn_id: &str, message: Message) -> bool {
        self.registry
            .read()
            .await
            .connections
            .get(conn_id)
            .is_some_and(|conn| conn.sender.send(message).is_ok())
    }

    /// Return the current number of active connections.
    pub async fn connection_count(&self) -> usize {
        self.registry.read().await.connections.len()
    }

    /// Number of connections subscribed to `job_id`.
    pub async fn room_size(&self, job_id: &str) -> usize {
        self.registry
            .read()
            .await
            .rooms
            .get(job_id)
            .map_or(0, HashSet::len)
    }

    /// Send a Close frame to every connection, then clear all state.
    ///
    /// Used during graceful shutdown to notify all clients before the
    /// server stops accepting new connections.
    pub async fn shutdown_all(&self) {
        let mut registry = self.registry.write().await;
        let count = registry.connections.len();
        for conn in registry.connections.values() {
            let _ = conn.sender.send(Message::Close(None));
        }
        registry.connections.clear();
        registry.rooms.clear();
        tracing::info!(count, "Closed all WebSocket connections");
    }

    /// Send a Ping frame to every connected client.
    pub async fn ping_all(&self) {
        let registry = self.registry.read().await;
        for conn in registry.connections.values() {
            let _ = conn.sender.send(Message::Ping(Bytes::new()));
        }
    }
}

impl Default for WsManager {
    fn default() -> Self {
        Self::new()
    }
}

fn leave(rooms: &mut HashMap<String, HashSet<String>>, job_id: &str, conn_id: &str) {
    if let Some(members) = rooms.get_mut(job_id) {
        members.remove(conn_id);
        if members.is_empty() {
            rooms.remove(job_id);
        }
    }
}

/// Encode a server message as a JSON text frame.
pub fn text_frame(message: &ServerMessage) -> Result<Message, serde_json::Error> {
    Ok(Message::Text(serde_json::to_string(message)?.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(n: u8) -> Message {
        Message::Text(format!("m{n}").into())
    }

    #[tokio::test]
    async fn emit_reaches_only_room_members() {
        let manager = WsManager::new();
        let mut a = manager.add("a".into()).await;
        let mut b = manager.add("b".into()).await;
        assert!(manager.subscribe("a", "job-1").await);

        assert_eq!(manager.emit_to_room("job-1", text(1)).await, 1);
        assert_eq!(a.try_recv().unwrap(), text(1));
        assert!(b.try_recv().is_err());
    }

    #[tokio::test]
    async fn emit_to_empty_room_is_dropped() {
        let manager = WsManager::new();
        let _a = manager.add("a".into()).await;
        assert_eq!(manager.emit_to_room("nobody", text(1)).await, 0);
    }

    #[tokio::test]
    async fn connection_may_join_several_rooms() {
        let manager = WsManager::new();
        let mut a = manager.add("a".into()).await;
        manager.subscribe("a", "j1").await;
        manager.subscribe("a", "j2").await;
        manager.subscribe("a", "j2").await;

        assert_eq!(manager.room_size("j2").await, 1);
        manager.emit_to_room("j1", text(1)).await;
        manager.emit_to_room("j2", text(2)).await;
        assert_eq!(a.try_recv().unwrap(), text(1));
        assert_eq!(a.try_recv().unwrap(), text(2));
    }

    #[tokio::test]
    async fn unsubscribe_leaves_room() {
        let manager = WsManager::new();
        let _a = manager.add("a".into()).await;
        manager.subscribe("a", "j1").await;

        assert!(manager.unsubscribe("a", "j1").await);
        assert!(!manager.unsubscribe("a", "j1").await);
        assert_eq!(manager.room_size("j1").await, 0);
    }

    #[tokio::test]
    async fn remove_leaves_every_room() {
        let manager = WsManager::new();
        let _a = manager.add("a".into()).await;
        let _b = manager.add("b".into()).await;
        manager.subscribe("a", "j1").await;
        manager.subscribe("a", "j2").await;
        manager.subscribe("b", "j1").await;

        manager.remove("a").await;

        assert_eq!(manager.connection_count().await, 1);
        assert_eq!(manager.room_size("j1").await, 1);
        assert_eq!(manager.room_size("j2").await, 0);
    }

    #[tokio::test]
    async fn subscribe_unknown_connection_fails() {
        let manager = WsManager::new();
        assert!(!manager.subscribe("ghost", "j1").await);
        assert_eq!(manager.room_size("j1").await, 0);
    }

    #[tokio::test]
    async fn shutdown_sends_close_and_clears() {
        let manager = WsManager::new();
        let mut a = manager.add("a".into()).await;
        manager.subscribe("a", "j1").await;

        manager.shutdown_all().await;

        assert_eq!(a.try_recv().unwrap(), Message::Close(None));
        assert_eq!(manager.connection_count().await, 0);
        assert_eq!(manager.room_size("j1").await, 0);
    }
}
