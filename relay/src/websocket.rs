//! WebSocket signaling endpoint
//!
//! Adapts axum's `WebSocket` to the `SignalingStream` trait; the connection
//! loop itself lives in `SignalingDispatcher::run`.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use relay_sfu::{PeerId, RoomId, ServerMessage, SignalingStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::server::AppState;

/// Signaling frames are small JSON documents
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// WebSocket stream implementation of `SignalingStream`
struct WebSocketStream {
    receiver: SplitStream<WebSocket>,
    sender: mpsc::Sender<String>,
    is_alive: Arc<AtomicBool>,
}

#[async_trait::async_trait]
impl SignalingStream for WebSocketStream {
    async fn recv(&mut self) -> Option<Result<String, String>> {
        loop {
            match self.receiver.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Close(_))) | None => return None,
                Some(Err(e)) => return Some(Err(format!("WebSocket error: {e}"))),
                // Ping/pong are answered by axum; binary frames are not part of the protocol
                Some(Ok(_)) => {}
            }
        }
    }

    fn send(&self, message: ServerMessage) -> Result<(), String> {
        let text = message.to_json()?;

        // Never block on a slow client
        self.sender.try_send(text).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                "Channel full: WebSocket client too slow to consume messages".to_string()
            }
            mpsc::error::TrySendError::Closed(_) => {
                "Channel closed: WebSocket client disconnected".to_string()
            }
        })
    }

    fn is_alive(&self) -> bool {
        self.is_alive.load(Ordering::Relaxed)
    }
}

/// Upgrade handler for `<signal_path>/{room_id}`
pub async fn signaling_handler(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(MAX_FRAME_SIZE)
        .on_upgrade(move |socket| handle_socket(socket, state, RoomId::from(room_id)))
}

async fn handle_socket(socket: WebSocket, state: AppState, room_id: RoomId) {
    let peer_id = PeerId::generate();
    info!(room_id = %room_id, peer_id = %peer_id, "WebSocket connection established");

    let (tx, mut rx) = mpsc::channel::<String>(state.outbound_buffer);
    let is_alive = Arc::new(AtomicBool::new(true));
    let (mut sink, receiver) = socket.split();

    // Spawn task to handle server messages -> WebSocket
    let writer_alive = Arc::clone(&is_alive);
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                error!("Failed to send WebSocket message: {}", e);
                writer_alive.store(false, Ordering::Relaxed);
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut stream = WebSocketStream {
        receiver,
        sender: tx,
        is_alive,
    };

    if let Err(e) = state.dispatcher.run(&mut stream, room_id.clone(), peer_id.clone()).await {
        debug!(peer_id = %peer_id, error = %e, "Signaling session ended with error");
    }

    // Dropping the sender lets the writer flush queued frames and close
    drop(stream);
    if let Err(e) = writer.await {
        error!("WebSocket writer task failed: {}", e);
    }

    info!(room_id = %room_id, peer_id = %peer_id, "WebSocket connection closed");
}
