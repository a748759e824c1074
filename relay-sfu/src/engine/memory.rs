//! In-process media engine
//!
//! Keeps every router, transport, producer and consumer in memory and
//! answers the engine API without moving any media. ICE and DTLS parameters
//! are fabricated from the configured listen addresses and port range;
//! capability matching and consumer parameter derivation are real.
//!
//! Every call is appended to a journal so callers can assert on the exact
//! sequence of engine operations, and failures or latency can be injected
//! per operation.

use super::{
    ConsumerInfo, ConsumerType, DtlsFingerprint, DtlsParameters, DtlsRole, EngineFatal,
    IceCandidate, IceParameters, MediaEngine, ProducerInfo, RouterInfo, TransportInfo,
};
use crate::config::{ConsumerLayers, WebRtcTransportConfig};
use crate::error::EngineError;
use crate::rtp::{
    RtcpParameters, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpEncodingParameters, RtpParameters,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

/// Engine operations that can carry injected failures or latency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineOp {
    CreateRouter,
    CreateTransport,
    SetMaxIncomingBitrate,
    ConnectTransport,
    Produce,
    Consume,
    ResumeConsumer,
    SetPreferredLayers,
    Close,
}

/// Journal entry for one engine call that reached the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    CreateRouter(RouterId),
    CloseRouter(RouterId),
    CreateTransport(TransportId),
    SetMaxIncomingBitrate(TransportId, u32),
    ConnectTransport(TransportId),
    CloseTransport(TransportId),
    Produce(ProducerId, MediaKind),
    CloseProducer(ProducerId),
    Consume {
        consumer_id: ConsumerId,
        producer_id: ProducerId,
        paused: bool,
    },
    ResumeConsumer(ConsumerId),
    SetPreferredLayers(ConsumerId, ConsumerLayers),
    CloseConsumer(ConsumerId),
}

struct RouterState {
    rtp_capabilities: RtpCapabilities,
}

struct TransportState {
    router_id: RouterId,
    connected: bool,
}

struct ProducerState {
    router_id: RouterId,
    transport_id: TransportId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,
}

struct ConsumerState {
    transport_id: TransportId,
    consumer_type: ConsumerType,
    paused: bool,
}

pub struct MemoryEngine {
    rtc_min_port: u16,
    rtc_max_port: u16,
    next_port: AtomicU32,
    next_mid: AtomicU32,
    routers: DashMap<RouterId, RouterState>,
    transports: DashMap<TransportId, TransportState>,
    producers: DashMap<ProducerId, ProducerState>,
    consumers: DashMap<ConsumerId, ConsumerState>,
    journal: Mutex<Vec<EngineCall>>,
    failures: Mutex<HashMap<EngineOp, String>>,
    latencies: Mutex<HashMap<EngineOp, Duration>>,
    dead: AtomicBool,
    fatal_tx: broadcast::Sender<EngineFatal>,
}

impl MemoryEngine {
    #[must_use]
    pub fn new(rtc_min_port: u16, rtc_max_port: u16) -> Self {
        let (fatal_tx, _) = broadcast::channel(4);
        Self {
            rtc_min_port,
            rtc_max_port: rtc_max_port.max(rtc_min_port),
            next_port: AtomicU32::new(0),
            next_mid: AtomicU32::new(0),
            routers: DashMap::new(),
            transports: DashMap::new(),
            producers: DashMap::new(),
            consumers: DashMap::new(),
            journal: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            latencies: Mutex::new(HashMap::new()),
            dead: AtomicBool::new(false),
            fatal_tx,
        }
    }

    /// Snapshot of every call that reached the engine, in order
    #[must_use]
    pub fn calls(&self) -> Vec<EngineCall> {
        self.journal.lock().clone()
    }

    /// Make every subsequent `op` fail with `reason` until cleared
    pub fn inject_failure(&self, op: EngineOp, reason: impl Into<String>) {
        self.failures.lock().insert(op, reason.into());
    }

    pub fn clear_failure(&self, op: EngineOp) {
        self.failures.lock().remove(&op);
    }

    /// Delay every subsequent `op` by `latency`
    pub fn inject_latency(&self, op: EngineOp, latency: Duration) {
        self.latencies.lock().insert(op, latency);
    }

    /// Simulate the engine process dying
    pub fn kill(&self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        error!(reason = %reason, "Media engine terminated");
        let _ = self.fatal_tx.send(EngineFatal { reason });
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_transports(&self) -> usize {
        self.transports.len()
    }

    #[must_use]
    pub fn live_producers(&self) -> usize {
        self.producers.len()
    }

    #[must_use]
    pub fn live_consumers(&self) -> usize {
        self.consumers.len()
    }

    #[must_use]
    pub fn live_routers(&self) -> usize {
        self.routers.len()
    }

    #[must_use]
    pub fn is_transport_connected(&self, transport_id: &TransportId) -> bool {
        self.transports
            .get(transport_id)
            .is_some_and(|t| t.connected)
    }

    /// Paused flag of a live consumer
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.consumers.get(consumer_id).map(|c| c.paused)
    }

    async fn enter(&self, op: EngineOp) -> Result<(), EngineError> {
        let latency = self.latencies.lock().get(&op).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.is_alive() {
            return Err(EngineError::Fatal);
        }
        if let Some(reason) = self.failures.lock().get(&op).cloned() {
            return Err(EngineError::rejected(op_name(op), reason));
        }
        Ok(())
    }

    fn record(&self, call: EngineCall) {
        debug!(call = ?call, "engine call");
        self.journal.lock().push(call);
    }

    fn allocate_port(&self) -> u16 {
        let span = u32::from(self.rtc_max_port - self.rtc_min_port) + 1;
        let offset = self.next_port.fetch_add(1, Ordering::Relaxed) % span;
        // offset < span <= u16::MAX + 1, so the sum stays within the configured range
        self.rtc_min_port + u16::try_from(offset).unwrap_or(0)
    }

    fn candidates(&self, options: &WebRtcTransportConfig) -> Vec<IceCandidate> {
        let mut candidates = Vec::new();
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_302_079, 1_076_276_479)
        } else {
            (1_076_276_479, 1_076_302_079)
        };

        for listen_ip in &options.listen_ips {
            let ip = options
                .announced_ip
                .clone()
                .unwrap_or_else(|| listen_ip.clone());
            let port = self.allocate_port();
            if options.enable_udp {
                candidates.push(IceCandidate {
                    foundation: format!("udpcandidate{}", candidates.len()),
                    priority: udp_priority,
                    ip: ip.clone(),
                    protocol: "udp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: None,
                });
            }
            if options.enable_tcp {
                candidates.push(IceCandidate {
                    foundation: format!("tcpcandidate{}", candidates.len()),
                    priority: tcp_priority,
                    ip,
                    protocol: "tcp".to_string(),
                    port,
                    candidate_type: "host".to_string(),
                    tcp_type: Some("passive".to_string()),
                });
            }
        }
        candidates
    }

    fn consumer_parameters(
        &self,
        producer: &ProducerState,
        remote: &RtpCapabilities,
    ) -> Result<RtpParameters, EngineError> {
        let (codec, capability) = producer
            .rtp_parameters
            .codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .find_map(|c| remote.find_matching(c).map(|cap| (c, cap)))
            .ok_or_else(|| EngineError::rejected("consume", "no codec supported by remote"))?;

        let encoding = RtpEncodingParameters {
            ssrc: Some(random_ssrc()),
            scalability_mode: producer
                .rtp_parameters
                .is_simulcast()
                .then(|| format!("S{}T3", producer.rtp_parameters.encodings.len())),
            ..Default::default()
        };

        Ok(RtpParameters {
            mid: Some(self.next_mid.fetch_add(1, Ordering::Relaxed).to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: capability.preferred_payload_type.unwrap_or(codec.payload_type),
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: capability.rtcp_feedback.clone(),
            }],
            header_extensions: producer.rtp_parameters.header_extensions.clone(),
            encodings: vec![encoding],
            rtcp: RtcpParameters {
                cname: producer.rtp_parameters.rtcp.cname.clone(),
                reduced_size: true,
            },
        })
    }
}

const fn op_name(op: EngineOp) -> &'static str {
    match op {
        EngineOp::CreateRouter => "createRouter",
        EngineOp::CreateTransport => "createWebRtcTransport",
        EngineOp::SetMaxIncomingBitrate => "setMaxIncomingBitrate",
        EngineOp::ConnectTransport => "connect",
        EngineOp::Produce => "produce",
        EngineOp::Consume => "consume",
        EngineOp::ResumeConsumer => "resume",
        EngineOp::SetPreferredLayers => "setPreferredLayers",
        EngineOp::Close => "close",
    }
}

fn random_ssrc() -> u32 {
    let bytes = Uuid::new_v4().into_bytes();
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn random_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[async_trait]
impl MediaEngine for MemoryEngine {
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError> {
        self.enter(EngineOp::CreateRouter).await?;
        let rtp_capabilities = RtpCapabilities::from_media_codecs(media_codecs)
            .map_err(|reason| EngineError::rejected("createRouter", reason))?;
        let id = RouterId::new(Uuid::new_v4().to_string());
        self.routers.insert(
            id.clone(),
            RouterState {
                rtp_capabilities: rtp_capabilities.clone(),
            },
        );
        self.record(EngineCall::CreateRouter(id.clone()));
        Ok(RouterInfo {
            id,
            rtp_capabilities,
        })
    }

    async fn close_router(&self, router_id: &RouterId) -> Result<(), EngineError> {
        self.enter(EngineOp::Close).await?;
        self.routers
            .remove(router_id)
            .ok_or_else(|| EngineError::Closed(router_id.to_string()))?;

        let orphaned: Vec<TransportId> = self
            .transports
            .iter()
            .filter(|t| &t.router_id == router_id)
            .map(|t| t.key().clone())
            .collect();
        for transport_id in orphaned {
            self.transports.remove(&transport_id);
            self.producers.retain(|_, p| p.transport_id != transport_id);
            self.consumers.retain(|_, c| c.transport_id != transport_id);
        }
        self.record(EngineCall::CloseRouter(router_id.clone()));
        Ok(())
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &RouterId,
        options: &WebRtcTransportConfig,
    ) -> Result<TransportInfo, EngineError> {
        self.enter(EngineOp::CreateTransport).await?;
        if !self.routers.contains_key(router_id) {
            return Err(EngineError::UnknownHandle(router_id.to_string()));
        }

        let id = TransportId::new(Uuid::new_v4().to_string());
        let info = TransportInfo {
            id: id.clone(),
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates: self.candidates(options),
            dtls_parameters: DtlsParameters {
                role: DtlsRole::Auto,
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        };
        self.transports.insert(
            id.clone(),
            TransportState {
                router_id: router_id.clone(),
                connected: false,
            },
        );
        self.record(EngineCall::CreateTransport(id));
        Ok(info)
    }

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: &TransportId,
        bitrate: u32,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::SetMaxIncomingBitrate).await?;
        if !self.transports.contains_key(transport_id) {
            return Err(EngineError::UnknownHandle(transport_id.to_string()));
        }
        self.record(EngineCall::SetMaxIncomingBitrate(transport_id.clone(), bitrate));
        Ok(())
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::ConnectTransport).await?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::rejected("connect", "dtlsParameters carry no fingerprint"));
        }
        let mut transport = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::UnknownHandle(transport_id.to_string()))?;
        if transport.connected {
            return Err(EngineError::rejected("connect", "connect() already called"));
        }
        transport.connected = true;
        drop(transport);
        self.record(EngineCall::ConnectTransport(transport_id.clone()));
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError> {
        self.enter(EngineOp::Close).await?;
        self.transports
            .remove(transport_id)
            .ok_or_else(|| EngineError::Closed(transport_id.to_string()))?;
        self.producers.retain(|_, p| &p.transport_id != transport_id);
        self.consumers.retain(|_, c| &c.transport_id != transport_id);
        self.record(EngineCall::CloseTransport(transport_id.clone()));
        Ok(())
    }

    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool {
        self.producers.get(producer_id).is_some_and(|producer| {
            &producer.router_id == router_id
                && rtp_capabilities.can_consume(&producer.rtp_parameters)
        })
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerInfo, EngineError> {
        self.enter(EngineOp::Produce).await?;
        let router_id = self
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| EngineError::UnknownHandle(transport_id.to_string()))?;
        rtp_parameters
            .validate(kind)
            .map_err(|reason| EngineError::rejected("produce", reason))?;

        let id = ProducerId::new(Uuid::new_v4().to_string());
        self.producers.insert(
            id.clone(),
            ProducerState {
                router_id,
                transport_id: transport_id.clone(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
                paused: false,
            },
        );
        self.record(EngineCall::Produce(id.clone(), kind));
        Ok(ProducerInfo {
            id,
            kind,
            rtp_parameters: rtp_parameters.clone(),
            paused: false,
        })
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError> {
        self.enter(EngineOp::Close).await?;
        self.producers
            .remove(producer_id)
            .ok_or_else(|| EngineError::Closed(producer_id.to_string()))?;
        self.record(EngineCall::CloseProducer(producer_id.clone()));
        Ok(())
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError> {
        self.enter(EngineOp::Consume).await?;
        if !self.transports.contains_key(transport_id) {
            return Err(EngineError::UnknownHandle(transport_id.to_string()));
        }
        let producer = self
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::UnknownHandle(producer_id.to_string()))?;

        let rtp_parameters = self.consumer_parameters(&producer, rtp_capabilities)?;
        let consumer_type = if producer.rtp_parameters.is_simulcast() {
            ConsumerType::Simulcast
        } else {
            ConsumerType::Simple
        };
        let kind = producer.kind;
        let producer_paused = producer.paused;
        drop(producer);

        let id = ConsumerId::new(Uuid::new_v4().to_string());
        self.consumers.insert(
            id.clone(),
            ConsumerState {
                transport_id: transport_id.clone(),
                consumer_type,
                paused,
            },
        );
        self.record(EngineCall::Consume {
            consumer_id: id.clone(),
            producer_id: producer_id.clone(),
            paused,
        });
        Ok(ConsumerInfo {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            consumer_type,
            paused,
            producer_paused,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineOp::ResumeConsumer).await?;
        let mut consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::UnknownHandle(consumer_id.to_string()))?;
        consumer.paused = false;
        drop(consumer);
        self.record(EngineCall::ResumeConsumer(consumer_id.clone()));
        Ok(())
    }

    async fn set_consumer_preferred_layers(
        &self,
        consumer_id: &ConsumerId,
        layers: ConsumerLayers,
    ) -> Result<(), EngineError> {
        self.enter(EngineOp::SetPreferredLayers).await?;
        let consumer = self
            .consumers
            .get(consumer_id)
            .ok_or_else(|| EngineError::UnknownHandle(consumer_id.to_string()))?;
        let layered = consumer.consumer_type.is_layered();
        drop(consumer);
        if layered {
            self.record(EngineCall::SetPreferredLayers(consumer_id.clone(), layers));
        }
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError> {
        self.enter(EngineOp::Close).await?;
        self.consumers
            .remove(consumer_id)
            .ok_or_else(|| EngineError::Closed(consumer_id.to_string()))?;
        self.record(EngineCall::CloseConsumer(consumer_id.clone()));
        Ok(())
    }

    fn subscribe_fatal(&self) -> broadcast::Receiver<EngineFatal> {
        self.fatal_tx.subscribe()
    }
}
