//! SFU Room management

use crate::capabilities::CapabilityRegistry;
use crate::signaling::ProducerAnnouncement;
use crate::types::{MediaKind, PeerId, ProducerId, RoomId};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Room-wide record of a live producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomProducer {
    pub owner: PeerId,
    pub kind: MediaKind,
}

/// One router plus the peers sharing it
pub struct SfuRoom {
    pub id: RoomId,
    capabilities: CapabilityRegistry,
    members: RwLock<HashSet<PeerId>>,
    producers: DashMap<ProducerId, RoomProducer>,
}

impl SfuRoom {
    #[must_use]
    pub fn new(id: RoomId, capabilities: CapabilityRegistry) -> Self {
        Self {
            id,
            capabilities,
            members: RwLock::new(HashSet::new()),
            producers: DashMap::new(),
        }
    }

    #[must_use]
    pub const fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    /// Returns false if the peer was already a member
    pub fn add_member(&self, peer_id: PeerId) -> bool {
        self.members.write().insert(peer_id)
    }

    /// Remove a member, returning whether the room is now empty
    pub fn remove_member(&self, peer_id: &PeerId) -> bool {
        let mut members = self.members.write();
        members.remove(peer_id);
        members.is_empty()
    }

    #[must_use]
    pub fn members_except(&self, peer_id: &PeerId) -> Vec<PeerId> {
        self.members
            .read()
            .iter()
            .filter(|id| *id != peer_id)
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.members.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.read().is_empty()
    }

    pub fn register_producer(&self, producer_id: ProducerId, owner: PeerId, kind: MediaKind) {
        self.producers.insert(producer_id, RoomProducer { owner, kind });
    }

    pub fn unregister_producer(&self, producer_id: &ProducerId) -> Option<RoomProducer> {
        self.producers.remove(producer_id).map(|(_, p)| p)
    }

    #[must_use]
    pub fn producer(&self, producer_id: &ProducerId) -> Option<RoomProducer> {
        self.producers.get(producer_id).map(|p| p.value().clone())
    }

    /// Producers owned by anyone but `peer_id`
    #[must_use]
    pub fn producers_except(&self, peer_id: &PeerId) -> Vec<ProducerAnnouncement> {
        let mut producers: Vec<ProducerAnnouncement> = self
            .producers
            .iter()
            .filter(|entry| &entry.owner != peer_id)
            .map(|entry| ProducerAnnouncement {
                producer_id: entry.key().clone(),
                peer_id: entry.owner.clone(),
                kind: entry.kind,
            })
            .collect();
        producers.sort_by(|a, b| a.producer_id.cmp(&b.producer_id));
        producers
    }

    #[must_use]
    pub fn get_stats(&self) -> RoomStats {
        let (audio_producers, video_producers) =
            self.producers
                .iter()
                .fold((0, 0), |(audio, video), entry| match entry.kind {
                    MediaKind::Audio => (audio + 1, video),
                    MediaKind::Video => (audio, video + 1),
                });
        RoomStats {
            peer_count: self.peer_count(),
            audio_producers,
            video_producers,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub peer_count: usize,
    pub audio_producers: usize,
    pub video_producers: usize,
}
