//! Notification WebSocket handler (spec.md §6: `/ws/notifications`).
//!
//! Subscribers reconnect on drop; this socket does not replay missed
//! events — it only streams whatever `PushChannel` publishes after the
//! connection is established.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;

pub async fn notifications(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.push.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                if socket.send(Message::Text(event.to_json())).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(msg)) => {
                        if let Some(pong) = handle_client_message(msg) {
                            if socket.send(pong).await.is_err() {
                                break;
                            }
                        }
                    }
                    _ => break,
                }
            }
        }
    }
}

/// Answers client pings; everything else from the client is ignored since
/// this socket is notification-only.
fn handle_client_message(msg: Message) -> Option<Message> {
    match msg {
        Message::Text(text) => {
            if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                if json.get("type").and_then(|t| t.as_str()) == Some("ping") {
                    let timestamp = json
                        .get("data")
                        .and_then(|d| d.get("timestamp"))
                        .and_then(|t| t.as_i64())
                        .unwrap_or(0);
                    let pong = serde_json::json!({
                        "type": "pong",
                        "data": { "timestamp": timestamp }
                    });
                    return Some(Message::Text(pong.to_string()));
                }
                None
            } else if text == "ping" {
                Some(Message::Text("pong".to_string()))
            } else {
                None
            }
        }
        Message::Close(_) => None,
        _ => None,
    }
}

