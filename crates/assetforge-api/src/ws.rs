//! WebSocket live-progress channel.

use assetforge_core::ConnectionId;
use assetforge_core::event::{ClientMessage, ServerMessage, Topic};
use assetforge_scheduler::ProgressBroadcaster;
use axum::body::Bytes;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.broadcaster))
}

async fn handle_socket(socket: WebSocket, broadcaster: Arc<ProgressBroadcaster>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let id = broadcaster.connect(tx).await;
    info!(connection_id = %id, "WebSocket connected");

    let (mut sink, mut stream) = socket.split();

    // Forward broadcaster messages and send a ping every heartbeat interval.
    let send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        loop {
            let frame = tokio::select! {
                message = rx.recv() => match message {
                    Some(message) => match serde_json::to_string(&message) {
                        Ok(text) => Message::Text(text.into()),
                        Err(e) => {
                            warn!(connection_id = %id, error = %e, "Failed to encode message");
                            continue;
                        }
                    },
                    // Dropped by the broadcaster, e.g. on shutdown.
                    None => break,
                },
                _ = heartbeat.tick() => Message::Ping(Bytes::new()),
            };
            if sink.send(frame).await.is_err() {
                debug!(connection_id = %id, "WebSocket sink closed");
                return;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => handle_message(&broadcaster, id, message).await,
                Err(e) => {
                    broadcaster
                        .send_to(
                            id,
                            ServerMessage::Error {
                                message: format!("invalid message: {}", e),
                            },
                        )
                        .await;
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Pong(_)) => {
                debug!(connection_id = %id, "Pong received");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    broadcaster.disconnect(id).await;
    send_task.abort();
    info!(connection_id = %id, "WebSocket disconnected");
}

async fn handle_message(broadcaster: &ProgressBroadcaster, id: ConnectionId, message: ClientMessage) {
    match message {
        ClientMessage::SubscribeJob { job_id } => {
            broadcaster.subscribe(id, Topic::Job(job_id)).await;
        }
        ClientMessage::UnsubscribeJob { job_id } => {
            broadcaster.unsubscribe(id, Topic::Job(job_id)).await;
        }
        ClientMessage::SubscribeProject { project_id } => {
            broadcaster.subscribe(id, Topic::Project(project_id)).await;
        }
        ClientMessage::UnsubscribeProject { project_id } => {
            broadcaster.unsubscribe(id, Topic::Project(project_id)).await;
        }
        ClientMessage::SubscribeGlobal => {
            broadcaster.subscribe(id, Topic::Global).await;
        }
        ClientMessage::UnsubscribeGlobal => {
            broadcaster.unsubscribe(id, Topic::Global).await;
        }
        ClientMessage::Authenticate { user_id } => {
            info!(connection_id = %id, user_id = %user_id, "WebSocket authenticated");
            broadcaster.authenticate(id, user_id).await;
        }
        ClientMessage::Ping => {
            broadcaster.send_to(id, ServerMessage::Pong).await;
        }
    }
}
