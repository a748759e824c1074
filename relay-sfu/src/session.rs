//! Peer sessions and the Session Registry
//!
//! The registry maps a connection id to its session. Each session sits
//! behind its own async mutex so operations for one peer are exclusive
//! while unrelated peers proceed in parallel; the registry map itself is a
//! sharded `DashMap` and is never held across an await.
//!
//! Notifications are queued with `try_send` and never wait on a slow peer.
//! When a peer's queue is full the notification is dropped and logged; the
//! peer can still find every live producer with `getProducers`.

use crate::engine::{ConsumerType, DtlsParameters};
use crate::error::{Result, SfuError};
use crate::gateway::EngineHandle;
use crate::rtp::RtpCapabilities;
use crate::signaling::Notification;
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, RoomId, TransportId, TransportRole};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Transport lifecycle. `Requested` exists only while the engine call is in
/// flight, so stored transports are either created or connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportState {
    Created,
    Connected { dtls_parameters: DtlsParameters },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEntry {
    pub id: TransportId,
    pub role: TransportRole,
    pub state: TransportState,
}

impl TransportEntry {
    #[must_use]
    pub fn new(id: TransportId, role: TransportRole) -> Self {
        Self {
            id,
            role,
            state: TransportState::Created,
        }
    }

    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, TransportState::Connected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerEntry {
    pub id: ProducerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerEntry {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub consumer_type: ConsumerType,
    pub paused: bool,
}

/// Negotiation state of one connected peer
#[derive(Debug)]
pub struct PeerSession {
    pub peer_id: PeerId,
    pub room_id: RoomId,
    send_transport: Option<TransportEntry>,
    recv_transport: Option<TransportEntry>,
    producers: HashMap<MediaKind, ProducerEntry>,
    consumers: HashMap<ProducerId, ConsumerEntry>,
    /// Capabilities most recently declared by the peer
    pub rtp_capabilities: Option<RtpCapabilities>,
    closed: bool,
}

impl PeerSession {
    #[must_use]
    pub fn new(peer_id: PeerId, room_id: RoomId) -> Self {
        Self {
            peer_id,
            room_id,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
            rtp_capabilities: None,
            closed: false,
        }
    }

    /// Fails once the session has been torn down
    pub fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(SfuError::NotFound(format!("session {}", self.peer_id)));
        }
        Ok(())
    }

    #[must_use]
    pub const fn transport(&self, role: TransportRole) -> Option<&TransportEntry> {
        match role {
            TransportRole::Send => self.send_transport.as_ref(),
            TransportRole::Recv => self.recv_transport.as_ref(),
        }
    }

    pub fn transport_mut(&mut self, role: TransportRole) -> Option<&mut TransportEntry> {
        match role {
            TransportRole::Send => self.send_transport.as_mut(),
            TransportRole::Recv => self.recv_transport.as_mut(),
        }
    }

    /// Store a transport, returning the one it replaces
    pub fn set_transport(&mut self, entry: TransportEntry) -> Option<TransportEntry> {
        match entry.role {
            TransportRole::Send => self.send_transport.replace(entry),
            TransportRole::Recv => self.recv_transport.replace(entry),
        }
    }

    pub fn take_transport(&mut self, role: TransportRole) -> Option<TransportEntry> {
        match role {
            TransportRole::Send => self.send_transport.take(),
            TransportRole::Recv => self.recv_transport.take(),
        }
    }

    /// The transport for `role`, required to be connected
    pub fn connected_transport(&self, role: TransportRole) -> Result<&TransportEntry> {
        match self.transport(role) {
            Some(entry) if entry.is_connected() => Ok(entry),
            Some(entry) => Err(SfuError::InvalidState(format!(
                "{role} transport {} is not connected",
                entry.id
            ))),
            None => Err(SfuError::InvalidState(format!("no {role} transport"))),
        }
    }

    #[must_use]
    pub fn producer(&self, kind: MediaKind) -> Option<&ProducerEntry> {
        self.producers.get(&kind)
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerEntry> {
        self.producers.values()
    }

    /// Record a producer, returning the same-kind producer it replaces
    pub fn insert_producer(&mut self, entry: ProducerEntry) -> Option<ProducerEntry> {
        self.producers.insert(entry.kind, entry)
    }

    pub fn take_producers(&mut self) -> Vec<ProducerEntry> {
        self.producers.drain().map(|(_, p)| p).collect()
    }

    #[must_use]
    pub fn consumer(&self, producer_id: &ProducerId) -> Option<&ConsumerEntry> {
        self.consumers.get(producer_id)
    }

    pub fn consumer_mut(&mut self, producer_id: &ProducerId) -> Option<&mut ConsumerEntry> {
        self.consumers.get_mut(producer_id)
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerEntry> {
        self.consumers.values()
    }

    /// Record a consumer keyed by its producer, returning the one it supersedes
    pub fn insert_consumer(&mut self, entry: ConsumerEntry) -> Option<ConsumerEntry> {
        self.consumers.insert(entry.producer_id.clone(), entry)
    }

    pub fn remove_consumer(&mut self, producer_id: &ProducerId) -> Option<ConsumerEntry> {
        self.consumers.remove(producer_id)
    }

    pub fn take_consumers(&mut self) -> Vec<ConsumerEntry> {
        self.consumers.drain().map(|(_, c)| c).collect()
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.closed
    }

    /// Close the session and hand back every engine handle it owned, in
    /// dependency order (consumers, producers, transports). The session
    /// rejects all further operations afterwards.
    pub fn close(&mut self) -> (Vec<EngineHandle>, Vec<ProducerEntry>) {
        self.closed = true;
        let consumers = self.take_consumers();
        let producers = self.take_producers();

        let mut handles: Vec<EngineHandle> = consumers
            .into_iter()
            .map(|c| EngineHandle::Consumer(c.id))
            .collect();
        handles.extend(producers.iter().map(|p| EngineHandle::Producer(p.id.clone())));
        handles.extend(
            [self.send_transport.take(), self.recv_transport.take()]
                .into_iter()
                .flatten()
                .map(|t| EngineHandle::Transport(t.id)),
        );
        (handles, producers)
    }
}

/// Registry entry: the session plus the channels used to reach its peer
#[derive(Debug)]
pub struct SessionHandle {
    pub peer_id: PeerId,
    pub room_id: RoomId,
    session: Mutex<PeerSession>,
    notifier: mpsc::Sender<Notification>,
    cancel: CancellationToken,
}

impl SessionHandle {
    /// Exclusive access to the session for the duration of one operation
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, PeerSession> {
        self.session.lock().await
    }

    /// Queue a notification without waiting for the peer.
    ///
    /// Returns false if the peer's queue is full or its connection is gone.
    pub fn notify(&self, notification: Notification) -> bool {
        match self.notifier.try_send(notification) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                warn!(peer_id = %self.peer_id, notification = ?dropped, "Notification queue full, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(peer_id = %self.peer_id, "Notification channel closed");
                false
            }
        }
    }

    /// Token cancelled when the session is torn down from the server side
    #[must_use]
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Authoritative in-memory store of peer sessions
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<PeerId, Arc<SessionHandle>>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session; the receiver yields the peer's notifications
    pub fn create(
        &self,
        peer_id: PeerId,
        room_id: RoomId,
        buffer: usize,
    ) -> Result<(Arc<SessionHandle>, mpsc::Receiver<Notification>)> {
        use dashmap::mapref::entry::Entry;

        match self.sessions.entry(peer_id.clone()) {
            Entry::Occupied(_) => Err(SfuError::InvalidState(format!(
                "session {peer_id} already exists"
            ))),
            Entry::Vacant(slot) => {
                let (notifier, receiver) = mpsc::channel(buffer.max(1));
                let handle = Arc::new(SessionHandle {
                    peer_id: peer_id.clone(),
                    room_id: room_id.clone(),
                    session: Mutex::new(PeerSession::new(peer_id, room_id)),
                    notifier,
                    cancel: CancellationToken::new(),
                });
                slot.insert(Arc::clone(&handle));
                Ok((handle, receiver))
            }
        }
    }

    pub fn get(&self, peer_id: &PeerId) -> Result<Arc<SessionHandle>> {
        self.sessions
            .get(peer_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SfuError::NotFound(format!("session {peer_id}")))
    }

    /// Remove a session; the caller releases its engine resources
    pub fn remove(&self, peer_id: &PeerId) -> Result<Arc<SessionHandle>> {
        self.sessions
            .remove(peer_id)
            .map(|(_, handle)| handle)
            .ok_or_else(|| SfuError::NotFound(format!("session {peer_id}")))
    }

    /// Remove and return every session
    pub fn drain(&self) -> Vec<Arc<SessionHandle>> {
        let ids: Vec<PeerId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove(id).ok()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::ProducerClosed;

    fn registry_with(peer: &str) -> (SessionRegistry, Arc<SessionHandle>, mpsc::Receiver<Notification>) {
        let registry = SessionRegistry::new();
        let (handle, rx) = registry
            .create(PeerId::from(peer), RoomId::from("room"), 1)
            .unwrap();
        (registry, handle, rx)
    }

    #[tokio::test]
    async fn test_registry_lifecycle() {
        let (registry, handle, _rx) = registry_with("a");

        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&registry.get(&PeerId::from("a")).unwrap(), &handle));
        assert!(registry
            .create(PeerId::from("a"), RoomId::from("room"), 1)
            .is_err());

        registry.remove(&PeerId::from("a")).unwrap();
        assert!(matches!(registry.get(&PeerId::from("a")), Err(SfuError::NotFound(_))));
        assert!(matches!(registry.remove(&PeerId::from("a")), Err(SfuError::NotFound(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_connected_transport_checks() {
        let (_registry, handle, _rx) = registry_with("a");
        let mut session = handle.lock().await;

        assert!(matches!(
            session.connected_transport(TransportRole::Send),
            Err(SfuError::InvalidState(_))
        ));
        session.set_transport(TransportEntry::new(TransportId::from("t1"), TransportRole::Send));
        assert!(session.connected_transport(TransportRole::Send).is_err());

        session.transport_mut(TransportRole::Send).unwrap().state = TransportState::Connected {
            dtls_parameters: DtlsParameters::default(),
        };
        assert_eq!(
            session.connected_transport(TransportRole::Send).unwrap().id,
            TransportId::from("t1")
        );
        assert!(session.transport(TransportRole::Recv).is_none());
    }

    #[tokio::test]
    async fn test_close_returns_handles_in_dependency_order() {
        let (_registry, handle, _rx) = registry_with("a");
        let mut session = handle.lock().await;
        session.set_transport(TransportEntry::new(TransportId::from("t1"), TransportRole::Send));
        session.set_transport(TransportEntry::new(TransportId::from("t2"), TransportRole::Recv));
        session.insert_producer(ProducerEntry {
            id: ProducerId::from("p1"),
            kind: MediaKind::Audio,
        });
        session.insert_consumer(ConsumerEntry {
            id: ConsumerId::from("c1"),
            producer_id: ProducerId::from("remote"),
            kind: MediaKind::Video,
            consumer_type: ConsumerType::Simple,
            paused: true,
        });

        let (handles, producers) = session.close();
        assert_eq!(
            handles,
            vec![
                EngineHandle::Consumer(ConsumerId::from("c1")),
                EngineHandle::Producer(ProducerId::from("p1")),
                EngineHandle::Transport(TransportId::from("t1")),
                EngineHandle::Transport(TransportId::from("t2")),
            ]
        );
        assert_eq!(producers.len(), 1);
        assert!(session.is_closed());
        assert!(session.ensure_open().is_err());
        assert!(session.close().0.is_empty());
    }

    #[tokio::test]
    async fn test_notify_never_blocks() {
        let (_registry, handle, mut rx) = registry_with("a");
        let closed = || {
            Notification::ProducerClosed(ProducerClosed {
                producer_id: ProducerId::from("p1"),
            })
        };

        assert!(handle.notify(closed()));
        assert!(!handle.notify(closed()));
        assert_eq!(rx.recv().await, Some(closed()));

        drop(rx);
        assert!(!handle.notify(closed()));
    }
}
