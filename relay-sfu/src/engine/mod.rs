//! Media engine boundary
//!
//! The SFU core never touches ICE, DTLS or RTP itself. Everything that
//! allocates media-plane resources goes through [`MediaEngine`], whose
//! handles (router, transport, producer, consumer ids) are opaque to the
//! rest of the crate. [`memory::MemoryEngine`] is the in-process
//! implementation used for signaling-only deployments and tests.

pub mod memory;

use crate::config::{ConsumerLayers, WebRtcTransportConfig};
use crate::error::EngineError;
use crate::rtp::{RtpCapabilities, RtpCodecCapability, RtpParameters};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// A router: one per room, owns the negotiated codec set
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub id: RouterId,
    pub rtp_capabilities: RtpCapabilities,
}

/// A freshly created WebRTC transport, not yet connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportInfo {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducerInfo {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerType {
    Simple,
    Simulcast,
    Svc,
}

impl ConsumerType {
    /// Whether the consumer can switch between spatial/temporal layers
    #[must_use]
    pub const fn is_layered(&self) -> bool {
        matches!(self, Self::Simulcast | Self::Svc)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerInfo {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumer_type: ConsumerType,
    pub paused: bool,
    pub producer_paused: bool,
}

/// Signal that the engine process is gone and every handle with it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineFatal {
    pub reason: String,
}

/// Operations of the external media engine.
///
/// Every async method is a round-trip to the engine. Handles passed back in
/// must have been produced by the same engine instance.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(
        &self,
        media_codecs: &[RtpCodecCapability],
    ) -> Result<RouterInfo, EngineError>;

    async fn close_router(&self, router_id: &RouterId) -> Result<(), EngineError>;

    async fn create_webrtc_transport(
        &self,
        router_id: &RouterId,
        options: &WebRtcTransportConfig,
    ) -> Result<TransportInfo, EngineError>;

    async fn set_max_incoming_bitrate(
        &self,
        transport_id: &TransportId,
        bitrate: u32,
    ) -> Result<(), EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: &TransportId) -> Result<(), EngineError>;

    /// Pure compatibility check, no side effects
    fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> bool;

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerInfo, EngineError>;

    async fn close_producer(&self, producer_id: &ProducerId) -> Result<(), EngineError>;

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo, EngineError>;

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    async fn set_consumer_preferred_layers(
        &self,
        consumer_id: &ConsumerId,
        layers: ConsumerLayers,
    ) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> Result<(), EngineError>;

    /// Subscribe to engine death notifications
    fn subscribe_fatal(&self) -> broadcast::Receiver<EngineFatal>;
}
