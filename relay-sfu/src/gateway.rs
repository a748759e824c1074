//! Media Engine Gateway
//!
//! Thin adapter over a [`MediaEngine`]: applies configured transport options,
//! bounds negotiation round-trips with the configured timeout and implements
//! the two best-effort paths (bitrate ceiling, teardown closes). It owns no
//! session state.

use crate::config::{ConsumerLayers, SfuConfig};
use crate::engine::{ConsumerInfo, DtlsParameters, EngineFatal, MediaEngine, ProducerInfo, RouterInfo, TransportInfo};
use crate::error::{EngineError, Result, SfuError};
use crate::rtp::{RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId, TransportRole};
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Any engine resource that must be released exactly once
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineHandle {
    Router(RouterId),
    Transport(TransportId),
    Producer(ProducerId),
    Consumer(ConsumerId),
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Router(id) => write!(f, "router {id}"),
            Self::Transport(id) => write!(f, "transport {id}"),
            Self::Producer(id) => write!(f, "producer {id}"),
            Self::Consumer(id) => write!(f, "consumer {id}"),
        }
    }
}

#[derive(Clone)]
pub struct MediaGateway {
    engine: Arc<dyn MediaEngine>,
    config: Arc<SfuConfig>,
}

impl MediaGateway {
    pub fn new(engine: Arc<dyn MediaEngine>, config: Arc<SfuConfig>) -> Self {
        Self { engine, config }
    }

    pub fn subscribe_fatal(&self) -> broadcast::Receiver<EngineFatal> {
        self.engine.subscribe_fatal()
    }

    pub async fn create_router(&self) -> Result<RouterInfo> {
        Ok(self.engine.create_router(&self.config.media_codecs).await?)
    }

    /// Create a WebRTC transport and apply the incoming bitrate ceiling.
    ///
    /// The creation round-trip is bounded by the negotiation timeout. A
    /// transport that the engine finishes creating after the deadline is
    /// closed as soon as it arrives.
    pub async fn create_transport(&self, router_id: &RouterId, role: TransportRole) -> Result<TransportInfo> {
        let engine = Arc::clone(&self.engine);
        let router = router_id.clone();
        let options = self.config.webrtc_transport.clone();
        let mut creation = tokio::spawn(async move {
            engine.create_webrtc_transport(&router, &options).await
        });

        let info = match tokio::time::timeout(self.config.negotiation_timeout(), &mut creation).await {
            Ok(Ok(result)) => result?,
            Ok(Err(join_err)) => {
                return Err(EngineError::rejected("createWebRtcTransport", join_err.to_string()).into());
            }
            Err(_) => {
                let engine = Arc::clone(&self.engine);
                tokio::spawn(async move {
                    if let Ok(Ok(late)) = creation.await {
                        debug!(transport_id = %late.id, "Closing transport that completed after timeout");
                        if let Err(e) = engine.close_transport(&late.id).await {
                            warn!(transport_id = %late.id, error = %e, "Failed to close late transport");
                        }
                    }
                });
                return Err(SfuError::NegotiationTimeout(format!("createTransport({role})")));
            }
        };

        let bitrate = self.config.webrtc_transport.max_incoming_bitrate;
        if bitrate > 0 {
            if let Err(e) = self.engine.set_max_incoming_bitrate(&info.id, bitrate).await {
                warn!(
                    transport_id = %info.id,
                    bitrate,
                    error = %e,
                    "Failed to apply incoming bitrate ceiling, continuing without it"
                );
            }
        }

        Ok(info)
    }

    /// Complete the DTLS handshake, bounded by the negotiation timeout
    pub async fn connect_transport(&self, transport_id: &TransportId, dtls_parameters: &DtlsParameters) -> Result<()> {
        match tokio::time::timeout(
            self.config.negotiation_timeout(),
            self.engine.connect_transport(transport_id, dtls_parameters),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(SfuError::NegotiationTimeout(format!("connectTransport({transport_id})"))),
        }
    }

    #[must_use]
    pub fn can_consume(&self, router_id: &RouterId, producer_id: &ProducerId, capabilities: &RtpCapabilities) -> bool {
        self.engine.can_consume(router_id, producer_id, capabilities)
    }

    pub async fn create_producer(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<ProducerInfo> {
        Ok(self.engine.produce(transport_id, kind, rtp_parameters).await?)
    }

    pub async fn create_consumer(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        capabilities: &RtpCapabilities,
        paused: bool,
    ) -> Result<ConsumerInfo> {
        Ok(self
            .engine
            .consume(transport_id, producer_id, capabilities, paused)
            .await?)
    }

    pub async fn resume_consumer(&self, consumer_id: &ConsumerId) -> Result<()> {
        Ok(self.engine.resume_consumer(consumer_id).await?)
    }

    /// Select simulcast/SVC layers; a no-op for simple consumers
    pub async fn set_preferred_layers(&self, consumer: &ConsumerInfo, layers: ConsumerLayers) -> Result<()> {
        if !consumer.consumer_type.is_layered() {
            return Ok(());
        }
        Ok(self
            .engine
            .set_consumer_preferred_layers(&consumer.id, layers)
            .await?)
    }

    pub async fn close(&self, handle: &EngineHandle) -> std::result::Result<(), EngineError> {
        match handle {
            EngineHandle::Router(id) => self.engine.close_router(id).await,
            EngineHandle::Transport(id) => self.engine.close_transport(id).await,
            EngineHandle::Producer(id) => self.engine.close_producer(id).await,
            EngineHandle::Consumer(id) => self.engine.close_consumer(id).await,
        }
    }

    /// Close every handle, logging failures without stopping.
    ///
    /// Returns how many closes succeeded.
    pub async fn close_all(&self, handles: &[EngineHandle]) -> usize {
        let results = join_all(handles.iter().map(|handle| async move {
            let result = self.close(handle).await;
            if let Err(e) = &result {
                warn!(handle = %handle, error = %e, "Failed to close engine resource");
            }
            result
        }))
        .await;
        results.iter().filter(|r| r.is_ok()).count()
    }
}
