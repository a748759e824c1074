//! Negotiation Coordinator
//!
//! Produce / consume / resume transitions plus the room fan-out that tells
//! other peers when producers appear or disappear. Operations that mutate a
//! session take it already locked; fan-out only ever locks the receiving
//! peer's session and never while another session lock is held.

use crate::config::ConsumerLayers;
use crate::error::{Result, SfuError};
use crate::gateway::{EngineHandle, MediaGateway};
use crate::room::SfuRoom;
use crate::rtp::{RtpCapabilities, RtpParameters};
use crate::session::{ConsumerEntry, PeerSession, ProducerEntry, SessionRegistry};
use crate::signaling::{ConsumerParams, Notification, ProducerAnnouncement, ProducerClosed};
use crate::types::{MediaKind, PeerId, ProducerId, TransportRole};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceOutcome {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    /// Same-kind producer this one superseded, already closed
    pub replaced: Option<ProducerId>,
}

pub struct NegotiationCoordinator {
    gateway: MediaGateway,
    sessions: SessionRegistry,
    preferred_layers: ConsumerLayers,
}

impl NegotiationCoordinator {
    #[must_use]
    pub const fn new(gateway: MediaGateway, sessions: SessionRegistry, preferred_layers: ConsumerLayers) -> Self {
        Self {
            gateway,
            sessions,
            preferred_layers,
        }
    }

    /// Accept a media stream on the peer's connected send transport
    pub async fn produce(
        &self,
        room: &SfuRoom,
        session: &mut PeerSession,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProduceOutcome> {
        session.ensure_open()?;
        let transport_id = session.connected_transport(TransportRole::Send)?.id.clone();

        let producer = self
            .gateway
            .create_producer(&transport_id, kind, &rtp_parameters)
            .await?;

        let replaced = match session.producer(kind).cloned() {
            Some(previous) => {
                room.unregister_producer(&previous.id);
                if let Err(e) = self
                    .gateway
                    .close(&EngineHandle::Producer(previous.id.clone()))
                    .await
                {
                    warn!(producer_id = %previous.id, error = %e, "Failed to close superseded producer");
                }
                Some(previous.id)
            }
            None => None,
        };

        session.insert_producer(ProducerEntry {
            id: producer.id.clone(),
            kind,
        });
        room.register_producer(producer.id.clone(), session.peer_id.clone(), kind);

        info!(
            room_id = %room.id,
            peer_id = %session.peer_id,
            producer_id = %producer.id,
            kind = %kind,
            "Producer created"
        );
        Ok(ProduceOutcome {
            producer_id: producer.id,
            kind,
            replaced,
        })
    }

    /// Tell every other peer in the room about a new producer.
    ///
    /// Delivery is a non-blocking enqueue per receiver. Returns how many
    /// peers were notified.
    pub fn announce_producer(&self, room: &SfuRoom, owner: &PeerId, producer_id: &ProducerId, kind: MediaKind) -> usize {
        let announcement = ProducerAnnouncement {
            producer_id: producer_id.clone(),
            peer_id: owner.clone(),
            kind,
        };
        let delivered = room
            .members_except(owner)
            .iter()
            .filter_map(|peer_id| self.sessions.get(peer_id).ok())
            .filter(|handle| handle.notify(Notification::NewProducer(announcement.clone())))
            .count();
        debug!(producer_id = %producer_id, delivered, "Announced new producer");
        delivered
    }

    /// Withdraw closed producers from the room: drop them from the index,
    /// notify the other peers and close any consumer they hold for them.
    pub async fn retire_producers(&self, room: &SfuRoom, owner: &PeerId, producer_ids: &[ProducerId]) {
        if producer_ids.is_empty() {
            return;
        }
        for producer_id in producer_ids {
            room.unregister_producer(producer_id);
        }

        for peer_id in room.members_except(owner) {
            let Ok(handle) = self.sessions.get(&peer_id) else {
                continue;
            };
            for producer_id in producer_ids {
                handle.notify(Notification::ProducerClosed(ProducerClosed {
                    producer_id: producer_id.clone(),
                }));
            }

            let orphaned: Vec<EngineHandle> = {
                let mut session = handle.lock().await;
                producer_ids
                    .iter()
                    .filter_map(|id| session.remove_consumer(id))
                    .map(|c| EngineHandle::Consumer(c.id))
                    .collect()
            };
            if !orphaned.is_empty() {
                debug!(peer_id = %peer_id, count = orphaned.len(), "Closing consumers of retired producers");
                self.gateway.close_all(&orphaned).await;
            }
        }
    }

    /// Relay a room producer to the peer over its connected receive transport
    pub async fn consume(
        &self,
        room: &SfuRoom,
        session: &mut PeerSession,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerParams> {
        session.ensure_open()?;
        let transport_id = session.connected_transport(TransportRole::Recv)?.id.clone();
        let producer = room
            .producer(&producer_id)
            .ok_or_else(|| SfuError::NotFound(format!("producer {producer_id}")))?;
        session.rtp_capabilities = Some(rtp_capabilities.clone());

        if !self
            .gateway
            .can_consume(room.capabilities().router_id(), &producer_id, &rtp_capabilities)
        {
            return Err(SfuError::IncompatibleCapabilities(format!(
                "peer {} cannot receive producer {producer_id}",
                session.peer_id
            )));
        }

        if let Some(previous) = session.remove_consumer(&producer_id) {
            if let Err(e) = self
                .gateway
                .close(&EngineHandle::Consumer(previous.id.clone()))
                .await
            {
                warn!(consumer_id = %previous.id, error = %e, "Failed to close superseded consumer");
            }
        }

        let paused = producer.kind == MediaKind::Video;
        let consumer = self
            .gateway
            .create_consumer(&transport_id, &producer_id, &rtp_capabilities, paused)
            .await?;

        if let Err(e) = self
            .gateway
            .set_preferred_layers(&consumer, self.preferred_layers)
            .await
        {
            if let Err(close_err) = self
                .gateway
                .close(&EngineHandle::Consumer(consumer.id.clone()))
                .await
            {
                warn!(consumer_id = %consumer.id, error = %close_err, "Failed to close consumer after layer selection failure");
            }
            return Err(e);
        }

        session.insert_consumer(ConsumerEntry {
            id: consumer.id.clone(),
            producer_id: producer_id.clone(),
            kind: consumer.kind,
            consumer_type: consumer.consumer_type,
            paused: consumer.paused,
        });

        info!(
            room_id = %room.id,
            peer_id = %session.peer_id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            paused,
            "Consumer created"
        );
        Ok(consumer.into())
    }

    /// Start traffic on a consumer created paused
    pub async fn resume_consumer(&self, session: &mut PeerSession, producer_id: &ProducerId) -> Result<()> {
        session.ensure_open()?;
        let consumer_id = session
            .consumer(producer_id)
            .map(|c| c.id.clone())
            .ok_or_else(|| SfuError::NotFound(format!("consumer for producer {producer_id}")))?;

        self.gateway.resume_consumer(&consumer_id).await?;
        if let Some(consumer) = session.consumer_mut(producer_id) {
            consumer.paused = false;
        }
        debug!(peer_id = %session.peer_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::CapabilityRegistry;
    use crate::config::SfuConfig;
    use crate::engine::memory::{EngineCall, EngineOp, MemoryEngine};
    use crate::engine::{DtlsFingerprint, DtlsParameters, MediaEngine};
    use crate::session::SessionHandle;
    use crate::transport::TransportOrchestrator;
    use crate::types::RoomId;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: Arc<MemoryEngine>,
        room: SfuRoom,
        sessions: SessionRegistry,
        orchestrator: TransportOrchestrator,
        coordinator: NegotiationCoordinator,
    }

    async fn fixture() -> Fixture {
        let config = Arc::new(SfuConfig::default());
        let engine = Arc::new(MemoryEngine::new(config.rtc_min_port, config.rtc_max_port));
        let router = engine.create_router(&config.media_codecs).await.unwrap();
        let gateway = MediaGateway::new(engine.clone(), Arc::clone(&config));
        let sessions = SessionRegistry::new();
        Fixture {
            engine,
            room: SfuRoom::new(RoomId::from("room"), CapabilityRegistry::new(router)),
            sessions: sessions.clone(),
            orchestrator: TransportOrchestrator::new(gateway.clone()),
            coordinator: NegotiationCoordinator::new(gateway, sessions, config.preferred_layers),
        }
    }

    impl Fixture {
        fn join(&self, peer: &str) -> (Arc<SessionHandle>, mpsc::Receiver<Notification>) {
            let peer_id = PeerId::from(peer);
            self.room.add_member(peer_id.clone());
            self.sessions.create(peer_id, self.room.id.clone(), 16).unwrap()
        }

        async fn connected(&self, handle: &SessionHandle, role: TransportRole) {
            let mut session = handle.lock().await;
            self.orchestrator
                .request_transport(&mut session, self.room.capabilities().router_id(), role)
                .await
                .unwrap();
            self.orchestrator
                .connect(&mut session, role, dtls())
                .await
                .unwrap();
        }
    }

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: crate::engine::DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    fn rtp(kind: MediaKind, simulcast: bool) -> RtpParameters {
        let codec = match kind {
            MediaKind::Audio => json!({"mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000, "channels": 2}),
            MediaKind::Video => json!({"mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000}),
        };
        let encodings = if simulcast {
            json!([{"rid": "l"}, {"rid": "m"}, {"rid": "h"}])
        } else {
            json!([{"ssrc": 1234}])
        };
        serde_json::from_value(json!({"codecs": [codec], "encodings": encodings})).unwrap()
    }

    #[tokio::test]
    async fn test_produce_requires_connected_send_transport() {
        let f = fixture().await;
        let (a, _rx) = f.join("a");

        let mut session = a.lock().await;
        let err = f
            .coordinator
            .produce(&f.room, &mut session, MediaKind::Audio, rtp(MediaKind::Audio, false))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::InvalidState(_)));

        f.orchestrator
            .request_transport(&mut session, f.room.capabilities().router_id(), TransportRole::Send)
            .await
            .unwrap();
        let err = f
            .coordinator
            .produce(&f.room, &mut session, MediaKind::Audio, rtp(MediaKind::Audio, false))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::InvalidState(_)));
        assert_eq!(f.engine.live_producers(), 0);
    }

    #[tokio::test]
    async fn test_same_kind_produce_replaces_previous() {
        let f = fixture().await;
        let (a, _rx) = f.join("a");
        f.connected(&a, TransportRole::Send).await;

        let mut session = a.lock().await;
        let first = f
            .coordinator
            .produce(&f.room, &mut session, MediaKind::Video, rtp(MediaKind::Video, false))
            .await
            .unwrap();
        let second = f
            .coordinator
            .produce(&f.room, &mut session, MediaKind::Video, rtp(MediaKind::Video, false))
            .await
            .unwrap();

        assert_eq!(second.replaced, Some(first.producer_id.clone()));
        assert!(f.room.producer(&first.producer_id).is_none());
        assert!(f.room.producer(&second.producer_id).is_some());
        assert!(f.engine.calls().contains(&EngineCall::CloseProducer(first.producer_id)));
        assert_eq!(f.engine.live_producers(), 1);
    }

    #[tokio::test]
    async fn test_announce_reaches_everyone_but_owner() {
        let f = fixture().await;
        let (_a, mut rx_a) = f.join("a");
        let (_b, mut rx_b) = f.join("b");
        let (_c, mut rx_c) = f.join("c");

        let delivered = f.coordinator.announce_producer(
            &f.room,
            &PeerId::from("a"),
            &ProducerId::from("p1"),
            MediaKind::Video,
        );
        assert_eq!(delivered, 2);

        let expected = Notification::NewProducer(ProducerAnnouncement {
            producer_id: ProducerId::from("p1"),
            peer_id: PeerId::from("a"),
            kind: MediaKind::Video,
        });
        assert_eq!(rx_b.try_recv().unwrap(), expected);
        assert_eq!(rx_c.try_recv().unwrap(), expected);
        assert!(rx_b.try_recv().is_err());
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_incompatible_consume_allocates_nothing() {
        let f = fixture().await;
        let (a, _rx_a) = f.join("a");
        let (b, _rx_b) = f.join("b");
        f.connected(&a, TransportRole::Send).await;
        f.connected(&b, TransportRole::Recv).await;

        let produced = {
            let mut session = a.lock().await;
            f.coordinator
                .produce(&f.room, &mut session, MediaKind::Audio, rtp(MediaKind::Audio, false))
                .await
                .unwrap()
        };

        let mut session = b.lock().await;
        let err = f
            .coordinator
            .consume(&f.room, &mut session, produced.producer_id, RtpCapabilities::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::IncompatibleCapabilities(_)));
        assert_eq!(session.consumers().count(), 0);
        assert_eq!(f.engine.live_consumers(), 0);
        assert!(!f
            .engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::Consume { .. })));
    }

    #[tokio::test]
    async fn test_consume_pauses_video_only_and_selects_layers() {
        let f = fixture().await;
        let (a, _rx_a) = f.join("a");
        let (b, _rx_b) = f.join("b");
        f.connected(&a, TransportRole::Send).await;
        f.connected(&b, TransportRole::Recv).await;

        let (audio, video) = {
            let mut session = a.lock().await;
            let audio = f
                .coordinator
                .produce(&f.room, &mut session, MediaKind::Audio, rtp(MediaKind::Audio, false))
                .await
                .unwrap();
            let video = f
                .coordinator
                .produce(&f.room, &mut session, MediaKind::Video, rtp(MediaKind::Video, true))
                .await
                .unwrap();
            (audio, video)
        };

        let caps = f.room.capabilities().capabilities().clone();
        let mut session = b.lock().await;
        let audio_consumer = f
            .coordinator
            .consume(&f.room, &mut session, audio.producer_id.clone(), caps.clone())
            .await
            .unwrap();
        let video_consumer = f
            .coordinator
            .consume(&f.room, &mut session, video.producer_id.clone(), caps)
            .await
            .unwrap();

        let calls = f.engine.calls();
        assert!(calls.contains(&EngineCall::Consume {
            consumer_id: audio_consumer.id.clone(),
            producer_id: audio.producer_id,
            paused: false,
        }));
        assert!(calls.contains(&EngineCall::Consume {
            consumer_id: video_consumer.id.clone(),
            producer_id: video.producer_id,
            paused: true,
        }));
        assert!(calls.contains(&EngineCall::SetPreferredLayers(
            video_consumer.id.clone(),
            ConsumerLayers::HIGHEST
        )));
        assert!(!calls
            .iter()
            .any(|c| matches!(c, EngineCall::SetPreferredLayers(id, _) if *id == audio_consumer.id)));
        assert!(!video_consumer.producer_paused);
        assert!(session.rtp_capabilities.is_some());
    }

    #[tokio::test]
    async fn test_layer_failure_closes_new_consumer() {
        let f = fixture().await;
        let (a, _rx_a) = f.join("a");
        let (b, _rx_b) = f.join("b");
        f.connected(&a, TransportRole::Send).await;
        f.connected(&b, TransportRole::Recv).await;
        let video = {
            let mut session = a.lock().await;
            f.coordinator
                .produce(&f.room, &mut session, MediaKind::Video, rtp(MediaKind::Video, true))
                .await
                .unwrap()
        };
        f.engine.inject_failure(EngineOp::SetPreferredLayers, "bad layers");

        let mut session = b.lock().await;
        let caps = f.room.capabilities().capabilities().clone();
        assert!(f
            .coordinator
            .consume(&f.room, &mut session, video.producer_id, caps)
            .await
            .is_err());
        assert_eq!(session.consumers().count(), 0);
        assert_eq!(f.engine.live_consumers(), 0);
    }

    #[tokio::test]
    async fn test_resume_requires_recorded_consumer() {
        let f = fixture().await;
        let (b, _rx_b) = f.join("b");

        let mut session = b.lock().await;
        let err = f
            .coordinator
            .resume_consumer(&mut session, &ProducerId::from("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_retire_closes_remote_consumers() {
        let f = fixture().await;
        let (a, _rx_a) = f.join("a");
        let (b, mut rx_b) = f.join("b");
        f.connected(&a, TransportRole::Send).await;
        f.connected(&b, TransportRole::Recv).await;
        let audio = {
            let mut session = a.lock().await;
            f.coordinator
                .produce(&f.room, &mut session, MediaKind::Audio, rtp(MediaKind::Audio, false))
                .await
                .unwrap()
        };
        let consumer = {
            let mut session = b.lock().await;
            let caps = f.room.capabilities().capabilities().clone();
            f.coordinator
                .consume(&f.room, &mut session, audio.producer_id.clone(), caps)
                .await
                .unwrap()
        };

        f.coordinator
            .retire_producers(&f.room, &PeerId::from("a"), std::slice::from_ref(&audio.producer_id))
            .await;

        assert!(f.room.producer(&audio.producer_id).is_none());
        assert_eq!(
            rx_b.try_recv().unwrap(),
            Notification::ProducerClosed(ProducerClosed {
                producer_id: audio.producer_id.clone()
            })
        );
        assert!(b.lock().await.consumer(&audio.producer_id).is_none());
        assert!(f.engine.calls().contains(&EngineCall::CloseConsumer(consumer.id)));
    }
}
