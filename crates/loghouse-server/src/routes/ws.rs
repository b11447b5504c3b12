//! WebSocket Notification Endpoint
//!
//! `GET /ws` upgrades and then speaks a two-frame client protocol:
//! `{"type": "subscribe", "projectId": "..."}` joins the broadcaster after a
//! project existence check, `{"type": "ping"}` gets a pong. Server pushes
//! are the coalesced `new_logs` frames produced by the ingest buffer.
//!
//! One subscription per socket; subscribing again moves it. The socket
//! task owns the receive half of an unbounded channel whose send half lives
//! in the broadcaster registry, so a socket that dies without a close frame
//! is pruned by the broadcaster on its next send.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    Subscribe {
        #[serde(rename = "projectId", alias = "project_id")]
        project_id: String,
    },
    Ping,
}

pub async fn websocket(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut subscription: Option<(String, Uuid)> = None;

    loop {
        tokio::select! {
            frame = rx.recv() => {
                match frame {
                    Some(text) => {
                        if sender.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientFrame>(&text) {
                            Ok(ClientFrame::Subscribe { project_id }) => {
                                subscribe(&state, &mut subscription, project_id, &tx).await
                            }
                            Ok(ClientFrame::Ping) => json!({ "type": "pong" }).to_string(),
                            // Unknown frames are ignored, not fatal
                            Err(_) => continue,
                        };
                        if sender.send(Message::Text(reply)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    if let Some((project_id, id)) = subscription {
        state.broadcaster.leave(&project_id, id);
    }
}

async fn subscribe(
    state: &AppState,
    subscription: &mut Option<(String, Uuid)>,
    project_id: String,
    tx: &mpsc::UnboundedSender<String>,
) -> String {
    let exists = state
        .store
        .project_exists(&project_id)
        .await
        .unwrap_or_else(|e| {
            warn!(project_id, error = %e, "Project existence check failed");
            false
        });
    if !exists {
        return json!({ "type": "error", "message": "unknown project" }).to_string();
    }

    if let Some((old_project, id)) = subscription.take() {
        state.broadcaster.leave(&old_project, id);
    }
    let id = state.broadcaster.join(&project_id, tx.clone());
    let ack = json!({ "type": "subscribed", "projectId": project_id }).to_string();
    *subscription = Some((project_id, id));
    ack
}
