//! Signaling Dispatcher
//!
//! Maps inbound signaling frames to orchestrator and coordinator operations
//! and owns the per-connection message loop. This is the only layer that
//! turns an [`SfuError`] into a wire error payload.
//!
//! Transports implement [`SignalingStream`]; everything else, from join to
//! teardown, lives in [`SignalingDispatcher::run`].

use crate::error::{Result, SfuError};
use crate::manager::SfuManager;
use crate::session::SessionHandle;
use crate::signaling::{Request, RequestEnvelope, Response, ServerMessage};
use crate::types::{PeerId, RoomId};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Bidirectional text channel to one peer
#[async_trait::async_trait]
pub trait SignalingStream: Send + Sync {
    /// Receive a raw text frame
    ///
    /// Returns None when the connection is closed
    async fn recv(&mut self) -> Option<std::result::Result<String, String>>;

    /// Queue a server message without waiting for the peer
    fn send(&self, message: ServerMessage) -> std::result::Result<(), String>;

    /// Check if connection is still alive
    fn is_alive(&self) -> bool;
}

#[derive(Clone)]
pub struct SignalingDispatcher {
    manager: Arc<SfuManager>,
}

impl SignalingDispatcher {
    #[must_use]
    pub const fn new(manager: Arc<SfuManager>) -> Self {
        Self { manager }
    }

    /// Run one peer connection until it closes or the server cancels it.
    ///
    /// Requests are handled one at a time, each to completion, so a peer's
    /// operations never overlap. The peer is torn down on every exit path.
    pub async fn run<S: SignalingStream>(&self, stream: &mut S, room_id: RoomId, peer_id: PeerId) -> Result<()> {
        let joined = match self.manager.join(room_id.clone(), peer_id.clone()).await {
            Ok(joined) => joined,
            Err(e) => {
                warn!(room_id = %room_id, peer_id = %peer_id, error = %e, "Join rejected");
                if let Err(send_err) = stream.send(ServerMessage::Response(Response::failure(0, &e))) {
                    debug!(error = %send_err, "Failed to deliver join rejection");
                }
                return Err(e);
            }
        };
        let session = joined.session;
        let mut notifications = joined.notifications;
        let cancelled = session.cancellation();
        info!(room_id = %room_id, peer_id = %peer_id, "Peer connected");

        loop {
            if !stream.is_alive() {
                debug!(peer_id = %peer_id, "Signaling stream no longer alive");
                break;
            }

            tokio::select! {
                () = cancelled.cancelled() => {
                    info!(peer_id = %peer_id, "Session cancelled by server");
                    break;
                }

                frame = stream.recv() => {
                    match frame {
                        Some(Ok(text)) => {
                            let reply = self.handle_frame(&session, &text).await;
                            if let Err(e) = stream.send(reply) {
                                warn!(peer_id = %peer_id, error = %e, "Failed to send response");
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(peer_id = %peer_id, error = %e, "Error receiving signaling frame");
                            break;
                        }
                        None => {
                            info!(peer_id = %peer_id, "Peer disconnected");
                            break;
                        }
                    }
                }

                notification = notifications.recv() => {
                    let Some(notification) = notification else {
                        break;
                    };
                    if let Err(e) = stream.send(ServerMessage::notification(notification)) {
                        warn!(peer_id = %peer_id, error = %e, "Failed to send notification");
                        break;
                    }
                }
            }
        }

        match self.manager.leave(&peer_id).await {
            Ok(()) => info!(room_id = %room_id, peer_id = %peer_id, "Peer session closed"),
            // Already torn down by an engine failure or shutdown
            Err(e) => debug!(peer_id = %peer_id, error = %e, "Peer session already released"),
        }
        Ok(())
    }

    /// Decode and execute one frame, producing the reply for the peer
    pub async fn handle_frame(&self, session: &SessionHandle, text: &str) -> ServerMessage {
        let envelope: RequestEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                let id = serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("id").and_then(Value::as_u64))
                    .unwrap_or(0);
                debug!(peer_id = %session.peer_id, error = %e, "Malformed signaling frame");
                return ServerMessage::Response(Response::failure(id, &SfuError::InvalidRequest(e.to_string())));
            }
        };

        let result = match Request::parse(&envelope.method, envelope.data) {
            Ok(request) => {
                debug!(
                    peer_id = %session.peer_id,
                    id = envelope.id,
                    method = request.method(),
                    "Dispatching request"
                );
                self.dispatch(session, request).await
            }
            Err(e) => Err(e),
        };

        ServerMessage::Response(match result {
            Ok(data) => Response::success(envelope.id, data),
            Err(e) => {
                debug!(
                    peer_id = %session.peer_id,
                    method = %envelope.method,
                    code = e.code(),
                    error = %e,
                    "Request failed"
                );
                Response::failure(envelope.id, &e)
            }
        })
    }

    /// Execute a request for the session. Fan-out to other peers happens
    /// after the session lock is released.
    pub async fn dispatch(&self, session: &SessionHandle, request: Request) -> Result<Option<Value>> {
        let room = self.manager.room(&session.room_id)?;

        match request {
            Request::GetRouterRtpCapabilities => {
                Ok(Some(serde_json::to_value(room.capabilities().capabilities())?))
            }
            Request::GetPeerId => Ok(Some(json!({ "peerId": session.peer_id }))),
            Request::GetProducers => Ok(Some(serde_json::to_value(
                room.producers_except(&session.peer_id),
            )?)),
            Request::CreateTransport { role } => {
                let orchestrator = self.manager.orchestrator()?;
                let outcome = {
                    let mut peer = session.lock().await;
                    orchestrator
                        .request_transport(&mut peer, room.capabilities().router_id(), role)
                        .await?
                };
                if !outcome.retired_producers.is_empty() {
                    self.manager
                        .coordinator()?
                        .retire_producers(&room, &session.peer_id, &outcome.retired_producers)
                        .await;
                }
                Ok(Some(serde_json::to_value(outcome.params)?))
            }
            Request::ConnectTransport { role, dtls_parameters } => {
                let orchestrator = self.manager.orchestrator()?;
                let mut peer = session.lock().await;
                orchestrator.connect(&mut peer, role, dtls_parameters).await?;
                Ok(None)
            }
            Request::Produce { kind, rtp_parameters } => {
                let coordinator = self.manager.coordinator()?;
                let outcome = {
                    let mut peer = session.lock().await;
                    coordinator.produce(&room, &mut peer, kind, rtp_parameters).await?
                };
                if let Some(replaced) = &outcome.replaced {
                    coordinator
                        .retire_producers(&room, &session.peer_id, std::slice::from_ref(replaced))
                        .await;
                }
                coordinator.announce_producer(&room, &session.peer_id, &outcome.producer_id, outcome.kind);
                Ok(Some(json!({ "id": outcome.producer_id })))
            }
            Request::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let coordinator = self.manager.coordinator()?;
                let mut peer = session.lock().await;
                let params = coordinator
                    .consume(&room, &mut peer, producer_id, rtp_capabilities)
                    .await?;
                Ok(Some(serde_json::to_value(params)?))
            }
            Request::ResumeConsumer { producer_id } => {
                let coordinator = self.manager.coordinator()?;
                let mut peer = session.lock().await;
                coordinator.resume_consumer(&mut peer, &producer_id).await?;
                Ok(None)
            }
        }
    }
}
