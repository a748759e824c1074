//! SFU Manager - Top-level orchestration for multi-room signaling
//!
//! This module provides:
//! - Room and peer lifecycle with resource limits
//! - Ownership of the media engine attachment
//! - Engine-death handling and graceful shutdown
//! - Global statistics collection

use crate::capabilities::CapabilityRegistry;
use crate::config::SfuConfig;
use crate::coordinator::NegotiationCoordinator;
use crate::engine::MediaEngine;
use crate::error::{Result, SfuError};
use crate::gateway::{EngineHandle, MediaGateway};
use crate::room::SfuRoom;
use crate::session::{SessionHandle, SessionRegistry};
use crate::signaling::Notification;
use crate::transport::TransportOrchestrator;
use crate::types::{PeerId, ProducerId, RoomId};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Global SFU manager statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ManagerStats {
    /// Whether a media engine is attached and alive
    pub engine_available: bool,
    /// Number of active rooms
    pub active_rooms: usize,
    /// Total number of peers across all rooms
    pub total_peers: usize,
    pub total_audio_producers: usize,
    pub total_video_producers: usize,
}

/// A peer admitted into a room
pub struct Joined {
    pub session: Arc<SessionHandle>,
    pub notifications: mpsc::Receiver<Notification>,
    pub room: Arc<SfuRoom>,
}

/// SFU Manager - manages rooms, sessions and the engine attachment
pub struct SfuManager {
    /// Configuration
    config: Arc<SfuConfig>,

    /// Gateway to the attached engine; `None` until attached or after it died
    gateway: RwLock<Option<MediaGateway>>,

    /// Stops the fatal-event watcher of the current engine
    engine_watch: RwLock<Option<CancellationToken>>,

    /// Active rooms (uses DashMap for lock-free concurrent access)
    rooms: DashMap<RoomId, Arc<SfuRoom>>,

    /// Per-room locks serializing membership changes and room creation or
    /// removal for one room id; unrelated rooms never contend
    room_locks: DashMap<RoomId, Arc<Mutex<()>>>,

    /// Rooms in `rooms` plus room creations still in flight
    room_slots: AtomicUsize,

    sessions: SessionRegistry,
}

impl SfuManager {
    /// Create a new SFU manager with no engine attached
    pub fn new(config: SfuConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            config: Arc::new(config),
            gateway: RwLock::new(None),
            engine_watch: RwLock::new(None),
            rooms: DashMap::new(),
            room_locks: DashMap::new(),
            room_slots: AtomicUsize::new(0),
            sessions: SessionRegistry::new(),
        });

        info!(
            max_rooms = manager.config.max_rooms,
            max_peers_per_room = manager.config.max_peers_per_room,
            negotiation_timeout_ms = manager.config.negotiation_timeout_ms,
            "SFU Manager initialized"
        );

        manager
    }

    /// Install a media engine and watch it for fatal events.
    ///
    /// Replaces any previous engine. Must be called from within a tokio
    /// runtime.
    pub fn attach_engine(self: &Arc<Self>, engine: Arc<dyn MediaEngine>) {
        let gateway = MediaGateway::new(engine, Arc::clone(&self.config));
        let mut fatal = gateway.subscribe_fatal();
        let token = CancellationToken::new();

        if let Some(previous) = self.engine_watch.write().replace(token.clone()) {
            previous.cancel();
        }
        *self.gateway.write() = Some(gateway);
        info!("Media engine attached");

        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    () = token.cancelled() => return,
                    event = fatal.recv() => event,
                };
                match event {
                    Ok(fatal) => {
                        if token.is_cancelled() {
                            return;
                        }
                        if let Some(manager) = manager.upgrade() {
                            manager.handle_engine_fatal(&fatal.reason).await;
                        }
                        return;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Engine fatal watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Gateway to the current engine
    pub fn gateway(&self) -> Result<MediaGateway> {
        self.gateway.read().clone().ok_or(SfuError::EngineUnavailable)
    }

    pub fn orchestrator(&self) -> Result<TransportOrchestrator> {
        Ok(TransportOrchestrator::new(self.gateway()?))
    }

    pub fn coordinator(&self) -> Result<NegotiationCoordinator> {
        Ok(NegotiationCoordinator::new(
            self.gateway()?,
            self.sessions.clone(),
            self.config.preferred_layers,
        ))
    }

    /// Admit a peer into a room, creating the room and its router on first
    /// join.
    ///
    /// Only joins and leaves of the same room id serialize against each
    /// other; router creation for one room never delays another.
    pub async fn join(&self, room_id: RoomId, peer_id: PeerId) -> Result<Joined> {
        let gateway = self.gateway()?;
        let lock = self.room_lock(&room_id);
        let guard = lock.lock().await;
        let result = self.admit(&gateway, &room_id, &peer_id).await;

        // A room this join created but could not populate is detached while
        // still locked; its router is closed after the lock is released
        let mut orphan = None;
        if result.is_err() {
            let empty = self
                .rooms
                .get(&room_id)
                .map(|r| Arc::clone(r.value()))
                .filter(|room| room.is_empty());
            if let Some(room) = empty {
                if self.detach_room(&room) {
                    orphan = Some(room);
                }
            }
        }
        drop(guard);
        self.release_room_lock(&room_id, lock);
        if let Some(room) = orphan {
            self.close_router(Some(&gateway), &room).await;
        }
        let joined = result?;

        // The fatal handler drops the gateway before draining sessions, so
        // a session registered after the drain is caught here
        if self.gateway.read().is_none() {
            if let Ok(handle) = self.sessions.remove(&peer_id) {
                self.teardown(&handle).await;
            }
            return Err(SfuError::EngineUnavailable);
        }
        Ok(joined)
    }

    /// Caller holds the room lock
    async fn admit(&self, gateway: &MediaGateway, room_id: &RoomId, peer_id: &PeerId) -> Result<Joined> {
        let existing = self.rooms.get(room_id).map(|r| Arc::clone(r.value()));
        let room = match existing {
            Some(room) => room,
            None => self.create_room(gateway, room_id).await?,
        };

        // Check peer limit (0 = unlimited)
        let peer_count = room.peer_count();
        if self.config.max_peers_per_room > 0 && peer_count >= self.config.max_peers_per_room {
            warn!(
                room_id = %room_id,
                current_peers = peer_count,
                max_peers = self.config.max_peers_per_room,
                "Peer limit reached for room"
            );
            return Err(SfuError::LimitReached(format!("room {room_id} is full")));
        }

        let (session, notifications) =
            self.sessions
                .create(peer_id.clone(), room_id.clone(), self.config.notification_buffer)?;
        room.add_member(peer_id.clone());

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            peer_count = peer_count + 1,
            "Added peer to room"
        );

        Ok(Joined {
            session,
            notifications,
            room,
        })
    }

    /// Caller holds the room lock
    async fn create_room(&self, gateway: &MediaGateway, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        self.reserve_room_slot()?;
        let router = match gateway.create_router().await {
            Ok(router) => router,
            Err(e) => {
                self.room_slots.fetch_sub(1, Ordering::SeqCst);
                return Err(e);
            }
        };

        let room = Arc::new(SfuRoom::new(room_id.clone(), CapabilityRegistry::new(router)));
        self.rooms.insert(room_id.clone(), Arc::clone(&room));
        info!(
            room_id = %room_id,
            router_id = %room.capabilities().router_id(),
            total_rooms = self.rooms.len(),
            "Created new room"
        );
        Ok(room)
    }

    /// Enforce room limit (0 = unlimited), counting creations in flight
    fn reserve_room_slot(&self) -> Result<()> {
        let max_rooms = self.config.max_rooms;
        self.room_slots
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (max_rooms == 0 || current < max_rooms).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|current| {
                warn!(current_rooms = current, max_rooms, "Room limit reached");
                SfuError::LimitReached("maximum number of rooms reached".to_string())
            })
    }

    fn room_lock(&self, room_id: &RoomId) -> Arc<Mutex<()>> {
        Arc::clone(self.room_locks.entry(room_id.clone()).or_default().value())
    }

    /// Drop a room lock, forgetting it once nobody else holds or waits on it
    fn release_room_lock(&self, room_id: &RoomId, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.room_locks
            .remove_if(room_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Tear down a peer: close its engine resources, withdraw its producers
    /// and release the room when it was the last member.
    pub async fn leave(&self, peer_id: &PeerId) -> Result<()> {
        let handle = self.sessions.remove(peer_id)?;
        self.teardown(&handle).await;
        Ok(())
    }

    async fn teardown(&self, handle: &SessionHandle) {
        handle.cancel();
        let (handles, producers) = handle.lock().await.close();
        let retired: Vec<ProducerId> = producers.into_iter().map(|p| p.id).collect();
        let gateway = self.gateway.read().clone();
        let room = self.rooms.get(&handle.room_id).map(|r| Arc::clone(r.value()));

        if let Some(gateway) = &gateway {
            let closed = gateway.close_all(&handles).await;
            debug!(peer_id = %handle.peer_id, closed, total = handles.len(), "Released peer resources");
        }

        let Some(room) = room else {
            return;
        };

        match &gateway {
            Some(gateway) => {
                NegotiationCoordinator::new(gateway.clone(), self.sessions.clone(), self.config.preferred_layers)
                    .retire_producers(&room, &handle.peer_id, &retired)
                    .await;
            }
            None => {
                for producer_id in &retired {
                    room.unregister_producer(producer_id);
                }
            }
        }

        let lock = self.room_lock(&room.id);
        let detached = {
            let _guard = lock.lock().await;
            room.remove_member(&handle.peer_id) && self.detach_room(&room)
        };
        self.release_room_lock(&room.id, lock);
        info!(
            room_id = %room.id,
            peer_id = %handle.peer_id,
            "Removed peer from room"
        );
        if detached {
            self.close_router(gateway.as_ref(), &room).await;
        }
    }

    /// Remove `room` from the room map if it is still the registered
    /// instance. Caller holds the room lock.
    fn detach_room(&self, room: &Arc<SfuRoom>) -> bool {
        let removed = self
            .rooms
            .remove_if(&room.id, |_, current| Arc::ptr_eq(current, room))
            .is_some();
        if removed {
            self.room_slots.fetch_sub(1, Ordering::SeqCst);
            info!(room_id = %room.id, remaining_rooms = self.rooms.len(), "Removed empty room");
        }
        removed
    }

    async fn close_router(&self, gateway: Option<&MediaGateway>, room: &SfuRoom) {
        let Some(gateway) = gateway else {
            return;
        };
        let router = EngineHandle::Router(room.capabilities().router_id().clone());
        if let Err(e) = gateway.close(&router).await {
            warn!(room_id = %room.id, error = %e, "Failed to close router");
        }
    }

    /// React to engine death: refuse new joins and drop every session
    /// and room without touching the dead engine.
    pub async fn handle_engine_fatal(&self, reason: &str) {
        error!(reason, "Media engine died, tearing down all sessions");
        self.gateway.write().take();
        if let Some(token) = self.engine_watch.write().take() {
            token.cancel();
        }

        let sessions = self.sessions.drain();
        for handle in &sessions {
            handle.cancel();
            let (abandoned, _) = handle.lock().await.close();
            debug!(
                peer_id = %handle.peer_id,
                abandoned = abandoned.len(),
                "Dropped engine handles owned by the dead engine"
            );
        }

        let room_ids: Vec<RoomId> = self.rooms.iter().map(|r| r.key().clone()).collect();
        for room_id in room_ids {
            if self.rooms.remove(&room_id).is_some() {
                self.room_slots.fetch_sub(1, Ordering::SeqCst);
            }
        }
        warn!(dropped_sessions = sessions.len(), "All sessions dropped after engine failure");
    }

    /// Close every session and room, then detach the engine
    pub async fn shutdown(&self) {
        info!(
            sessions = self.sessions.len(),
            rooms = self.rooms.len(),
            "Shutting down SFU manager"
        );
        for handle in self.sessions.drain() {
            self.teardown(&handle).await;
        }

        let gateway = self.gateway.write().take();
        if let Some(token) = self.engine_watch.write().take() {
            token.cancel();
        }

        let rooms: Vec<Arc<SfuRoom>> = self.rooms.iter().map(|r| Arc::clone(r.value())).collect();
        for room in rooms {
            if self.detach_room(&room) {
                self.close_router(gateway.as_ref(), &room).await;
            }
        }
        info!("SFU manager shut down");
    }

    /// Get a room by id
    pub fn room(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        self.rooms
            .get(room_id)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| SfuError::NotFound(format!("room {room_id}")))
    }

    /// Get global manager statistics
    #[must_use]
    pub fn stats(&self) -> ManagerStats {
        self.rooms.iter().fold(
            ManagerStats {
                engine_available: self.gateway.read().is_some(),
                active_rooms: self.rooms.len(),
                ..Default::default()
            },
            |mut stats, entry| {
                let room = entry.value().get_stats();
                stats.total_peers += room.peer_count;
                stats.total_audio_producers += room.audio_producers;
                stats.total_video_producers += room.video_producers;
                stats
            },
        )
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Get number of active rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}
