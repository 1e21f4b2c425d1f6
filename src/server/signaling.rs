//! Signaling broker for live classes
//!
//! Each participant holds one websocket at `/live/:peer_id`. Offers,
//! answers, candidates and leaves are relayed to `dst` with `src` set to
//! the sending socket's owner.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, trace, warn};

use super::auth::AppState;
use crate::live::SignalMessage;

/// Registry of connected participants
#[derive(Clone, Default)]
pub struct SignalingBroker {
    peers: Arc<RwLock<HashMap<String, mpsc::Sender<String>>>>,
}

impl SignalingBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Claim `peer_id` for a socket. False when another socket holds it.
    async fn register(&self, peer_id: &str, tx: mpsc::Sender<String>) -> bool {
        let mut peers = self.peers.write().await;
        if peers.contains_key(peer_id) {
            return false;
        }
        peers.insert(peer_id.to_string(), tx);
        true
    }

    async fn unregister(&self, peer_id: &str, tx: &mpsc::Sender<String>) {
        let mut peers = self.peers.write().await;
        if peers.get(peer_id).is_some_and(|current| current.same_channel(tx)) {
            peers.remove(peer_id);
        }
    }

    /// Relay a message from `owner`. Returns the reply for the sender, if any.
    async fn route(&self, owner: &str, msg: SignalMessage) -> Option<SignalMessage> {
        let Some(dst) = msg.dst().map(str::to_string) else {
            debug!("Ignoring {} from {} without destination", msg.msg_type(), owner);
            return None;
        };
        let is_leave = matches!(msg, SignalMessage::Leave { .. });
        let msg = msg.with_src(owner);

        let target = self.peers.read().await.get(&dst).cloned();
        let delivered = match (target, serde_json::to_string(&msg)) {
            (Some(tx), Ok(json)) => tx.send(json).await.is_ok(),
            (_, Err(e)) => {
                warn!("Failed to encode {}: {}", msg.msg_type(), e);
                false
            }
            (None, _) => false,
        };

        if delivered {
            trace!("Relayed {} {} -> {}", msg.msg_type(), owner, dst);
            None
        } else if is_leave {
            None
        } else {
            debug!("{} is not connected, expiring {} from {}", dst, msg.msg_type(), owner);
            Some(SignalMessage::Expire { dst })
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(peer_id): Path<String>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, peer_id, state.broker))
}

async fn handle_socket(socket: WebSocket, peer_id: String, broker: SignalingBroker) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(100);

    if !broker.register(&peer_id, tx.clone()).await {
        info!("Rejecting duplicate live peer {}", peer_id);
        let reply = SignalMessage::IdTaken { id: peer_id };
        if let Ok(json) = serde_json::to_string(&reply) {
            let _ = sender.send(Message::Text(json)).await;
        }
        let _ = sender.send(Message::Close(None)).await;
        return;
    }

    // Spawn task to forward messages to client
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    info!("Live peer {} connected", peer_id);
    if let Ok(json) = serde_json::to_string(&SignalMessage::Open { id: peer_id.clone() }) {
        let _ = tx.send(json).await;
    }

    while let Some(result) = receiver.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("WebSocket error: {}", e);
                break;
            }
        };

        let msg = match serde_json::from_str::<SignalMessage>(&text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Invalid signal from {}: {}", peer_id, e);
                continue;
            }
        };

        if let Some(reply) = broker.route(&peer_id, msg).await {
            if let Ok(json) = serde_json::to_string(&reply) {
                let _ = tx.send(json).await;
            }
        }
    }

    broker.unregister(&peer_id, &tx).await;
    drop(tx);
    send_task.abort();
    info!("Live peer {} disconnected", peer_id);
}
