//! Browser refresh channel
//!
//! A broadcast fan-out that connected browser clients subscribe to over
//! WebSocket. Consumers publish update payloads and diagnostics messages;
//! the channel is fire-and-forget with no acknowledgement.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{debug, warn};

const CHANNEL_CAPACITY: usize = 64;

/// Cloneable handle onto the refresh channel. Sends are best-effort: with no
/// connected browser the message is dropped.
#[derive(Clone)]
pub struct RefreshServer {
    tx: broadcast::Sender<String>,
}

impl Default for RefreshServer {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshServer {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish one JSON document to every connected browser.
    pub fn send_json<T: Serialize>(&self, value: &T) {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(err) => {
                warn!(
                    component = "refresh",
                    event = "refresh.serialize_failed",
                    error = %err,
                    "Failed to serialize refresh message"
                );
                return;
            }
        };
        // Err means no subscriber; that is fine for a fire-and-forget channel.
        let _ = self.tx.send(json);
    }

    /// Ask connected browsers to reload the page.
    pub fn reload(&self) {
        self.send_json(&json!({ "type": "Reload" }));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    /// Router exposing the `/refresh` WebSocket endpoint.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/refresh", get(ws_handler))
            .with_state(self.clone())
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(server): State<RefreshServer>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(socket: WebSocket, server: RefreshServer) {
    debug!(
        component = "refresh",
        event = "refresh.client_connected",
        "Browser refresh client connected"
    );

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut rx = server.subscribe();

    loop {
        tokio::select! {
            msg = rx.recv() => match msg {
                Ok(json) => {
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        component = "refresh",
                        event = "refresh.client_lagged",
                        skipped,
                        "Refresh client lagged, skipped {skipped} messages"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = ws_rx.next() => match incoming {
                Some(Ok(Message::Ping(data))) => {
                    if ws_tx.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(
                        component = "refresh",
                        event = "refresh.client_error",
                        error = %err,
                        "Refresh client errored"
                    );
                    break;
                }
            },
        }
    }

    debug!(
        component = "refresh",
        event = "refresh.client_disconnected",
        "Browser refresh client disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use cinder_protocol::DiagnosticsMessage;

    #[tokio::test]
    async fn published_json_reaches_subscribers() {
        let server = RefreshServer::new();
        let mut rx = server.subscribe();

        server.send_json(&DiagnosticsMessage::new(vec!["app: error: boom".into()]));

        let raw = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "HotReloadDiagnosticsv1");
        assert_eq!(value["diagnostics"][0], "app: error: boom");
    }

    #[tokio::test]
    async fn reload_sends_the_reload_command() {
        let server = RefreshServer::new();
        let mut rx = server.subscribe();

        server.reload();

        let raw = rx.recv().await.unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["type"], "Reload");
    }

    #[tokio::test]
    async fn sending_without_subscribers_is_a_no_op() {
        let server = RefreshServer::new();
        // Must not panic or block.
        server.reload();
    }
}
