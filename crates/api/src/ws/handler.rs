use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use folio_core::messages::{ClientMessage, ServerMessage};
use futures::{SinkExt, StreamExt};

use crate::state::AppState;
use crate::ws::manager::{text_frame, WsManager};

/// HTTP handler that upgrades the connection to WebSocket.
///
/// After the upgrade the connection is registered with `WsManager` and
/// managed by a spawned sender task plus the receive loop.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.ws_manager))
}

/// Manage a single WebSocket connection after upgrade.
///
/// Splits the socket into a sink (outbound) and stream (inbound), then:
///   1. Registers the connection with `WsManager`.
///   2. Queues `connection_confirmed` as the first outbound frame.
///   3. Spawns a sender task that forwards messages from the manager channel.
///   4. Dispatches inbound subscribe / unsubscribe frames on the current task.
///   5. Leaves every room on disconnect.
async fn handle_socket(socket: WebSocket, ws_manager: Arc<WsManager>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket connected");

    let mut rx = ws_manager.add(conn_id.clone()).await;
    reply(
        &ws_manager,
        &conn_id,
        &ServerMessage::ConnectionConfirmed {
            connection_id: conn_id.clone(),
        },
    )
    .await;

    let (mut sink, mut stream) = socket.split();

    // Sender task: forward channel messages to the WebSocket sink.
    let sender_conn_id = conn_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() {
                tracing::debug!(conn_id = %sender_conn_id, "WebSocket sink closed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                dispatch(&ws_manager, &conn_id, text.as_str()).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                tracing::trace!(conn_id = %conn_id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    ws_manager.remove(&conn_id).await;
    send_task.abort();
    tracing::info!(conn_id = %conn_id, "WebSocket disconnected");
}

/// Apply one client frame to the connection's room membership.
async fn dispatch(ws_manager: &WsManager, conn_id: &str, text: &str) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            tracing::debug!(conn_id, error = %e, "Unparseable client frame");
            reply(
                ws_manager,
                conn_id,
                &ServerMessage::Error {
                    message: format!("invalid message: {e}"),
                },
            )
            .await;
            return;
        }
    };

    match message {
        ClientMessage::Subscribe { job_id, ack } => {
            ws_manager.subscribe(conn_id, &job_id).await;
            tracing::debug!(conn_id, job_id = %job_id, "Subscribed to job room");
            if ack {
                reply(ws_manager, conn_id, &ServerMessage::Subscribed { job_id }).await;
            }
        }
        ClientMessage::Unsubscribe { job_id, ack } => {
            ws_manager.unsubscribe(conn_id, &job_id).await;
            tracing::debug!(conn_id, job_id = %job_id, "Unsubscribed from job room");
            if ack {
                reply(ws_manager, conn_id, &ServerMessage::Unsubscribed { job_id }).await;
            }
        }
    }
}

async fn reply(ws_manager: &WsManager, conn_id: &str, message: &ServerMessage) {
    match text_frame(message) {
        Ok(frame) => {
            ws_manager.send_to(conn_id, frame).await;
        }
        Err(e) => tracing::error!(conn_id, error = %e, "Failed to encode server message"),
    }
}
