//! Transport Orchestrator
//!
//! Drives each peer transport through `Requested -> Created -> Connected`.
//! All methods run with the peer's session locked by the caller.

use crate::engine::DtlsParameters;
use crate::error::{Result, SfuError};
use crate::gateway::{EngineHandle, MediaGateway};
use crate::session::{PeerSession, TransportEntry, TransportState};
use crate::signaling::TransportParams;
use crate::types::{ProducerId, RouterId, TransportRole};
use tracing::{debug, info, warn};

/// Result of a transport request
#[derive(Debug)]
pub struct TransportOutcome {
    pub params: TransportParams,
    /// Producers that lived on a replaced send transport and are now closed
    pub retired_producers: Vec<ProducerId>,
}

pub struct TransportOrchestrator {
    gateway: MediaGateway,
}

impl TransportOrchestrator {
    #[must_use]
    pub const fn new(gateway: MediaGateway) -> Self {
        Self { gateway }
    }

    /// Create a transport for `role`, replacing any existing one.
    ///
    /// A replaced transport is closed in the engine together with every
    /// producer or consumer that was running on it.
    pub async fn request_transport(
        &self,
        session: &mut PeerSession,
        router_id: &RouterId,
        role: TransportRole,
    ) -> Result<TransportOutcome> {
        session.ensure_open()?;

        let info = self.gateway.create_transport(router_id, role).await?;
        let retired_producers = match session.take_transport(role) {
            Some(previous) => self.release(session, previous).await,
            None => Vec::new(),
        };
        session.set_transport(TransportEntry::new(info.id.clone(), role));

        info!(
            peer_id = %session.peer_id,
            transport_id = %info.id,
            role = %role,
            "Transport created"
        );
        Ok(TransportOutcome {
            params: info.into(),
            retired_producers,
        })
    }

    /// Exchange DTLS parameters and mark the transport connected.
    ///
    /// Repeating a connect with identical parameters is accepted as a retry;
    /// anything else on a connected transport is an ordering error.
    pub async fn connect(
        &self,
        session: &mut PeerSession,
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        session.ensure_open()?;

        let entry = session
            .transport(role)
            .ok_or_else(|| SfuError::InvalidState(format!("no {role} transport to connect")))?;
        let transport_id = entry.id.clone();
        match &entry.state {
            TransportState::Connected {
                dtls_parameters: connected_with,
            } if *connected_with == dtls_parameters => {
                debug!(transport_id = %transport_id, "Repeated connect with identical parameters");
                return Ok(());
            }
            TransportState::Connected { .. } => {
                return Err(SfuError::InvalidState(format!(
                    "{role} transport {transport_id} is already connected"
                )));
            }
            TransportState::Created => {}
        }

        match self
            .gateway
            .connect_transport(&transport_id, &dtls_parameters)
            .await
        {
            Ok(()) => {
                if let Some(entry) = session.transport_mut(role) {
                    entry.state = TransportState::Connected { dtls_parameters };
                }
                info!(
                    peer_id = %session.peer_id,
                    transport_id = %transport_id,
                    role = %role,
                    "Transport connected"
                );
                Ok(())
            }
            Err(SfuError::NegotiationTimeout(what)) => {
                warn!(transport_id = %transport_id, "DTLS connect timed out, closing transport");
                if let Some(previous) = session.take_transport(role) {
                    self.release(session, previous).await;
                }
                Err(SfuError::NegotiationTimeout(what))
            }
            Err(e) => Err(e),
        }
    }

    /// Close a transport and everything the session ran on it
    async fn release(&self, session: &mut PeerSession, transport: TransportEntry) -> Vec<ProducerId> {
        let mut handles = Vec::new();
        let mut retired = Vec::new();
        match transport.role {
            TransportRole::Send => {
                for producer in session.take_producers() {
                    retired.push(producer.id.clone());
                    handles.push(EngineHandle::Producer(producer.id));
                }
            }
            TransportRole::Recv => {
                handles.extend(
                    session
                        .take_consumers()
                        .into_iter()
                        .map(|c| EngineHandle::Consumer(c.id)),
                );
            }
        }
        debug!(
            transport_id = %transport.id,
            children = handles.len(),
            "Releasing replaced transport"
        );
        handles.push(EngineHandle::Transport(transport.id));
        self.gateway.close_all(&handles).await;
        retired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SfuConfig;
    use crate::engine::memory::{EngineCall, EngineOp, MemoryEngine};
    use crate::engine::{DtlsFingerprint, MediaEngine};
    use crate::types::{PeerId, RoomId, TransportId};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        engine: Arc<MemoryEngine>,
        orchestrator: TransportOrchestrator,
        router_id: RouterId,
        session: PeerSession,
    }

    async fn fixture() -> Fixture {
        let config = Arc::new(SfuConfig::default());
        let engine = Arc::new(MemoryEngine::new(config.rtc_min_port, config.rtc_max_port));
        let router = engine.create_router(&config.media_codecs).await.unwrap();
        let gateway = MediaGateway::new(engine.clone(), config);
        Fixture {
            engine,
            orchestrator: TransportOrchestrator::new(gateway),
            router_id: router.id,
            session: PeerSession::new(PeerId::from("a"), RoomId::from("room")),
        }
    }

    fn dtls(value: &str) -> DtlsParameters {
        DtlsParameters {
            role: crate::engine::DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: value.to_string(),
            }],
        }
    }

    fn closes_of(engine: &MemoryEngine, id: &TransportId) -> usize {
        engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::CloseTransport(t) if t == id))
            .count()
    }

    #[tokio::test]
    async fn test_second_send_transport_closes_first_once() {
        let mut f = fixture().await;
        let first = f
            .orchestrator
            .request_transport(&mut f.session, &f.router_id, TransportRole::Send)
            .await
            .unwrap();
        let second = f
            .orchestrator
            .request_transport(&mut f.session, &f.router_id, TransportRole::Send)
            .await
            .unwrap();

        assert_ne!(first.params.id, second.params.id);
        assert_eq!(closes_of(&f.engine, &first.params.id), 1);
        assert_eq!(closes_of(&f.engine, &second.params.id), 0);
        assert_eq!(
            f.session.transport(TransportRole::Send).map(|t| t.id.clone()),
            Some(second.params.id)
        );
        assert_eq!(f.engine.live_transports(), 1);
    }

    #[tokio::test]
    async fn test_connect_before_create_is_invalid_state() {
        let mut f = fixture().await;
        let err = f
            .orchestrator
            .connect(&mut f.session, TransportRole::Recv, dtls("AA"))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_connect_transitions_and_rejects_conflicting_repeat() {
        let mut f = fixture().await;
        f.orchestrator
            .request_transport(&mut f.session, &f.router_id, TransportRole::Send)
            .await
            .unwrap();

        f.orchestrator
            .connect(&mut f.session, TransportRole::Send, dtls("AA"))
            .await
            .unwrap();
        assert!(f.session.connected_transport(TransportRole::Send).is_ok());

        f.orchestrator
            .connect(&mut f.session, TransportRole::Send, dtls("AA"))
            .await
            .unwrap();
        let err = f
            .orchestrator
            .connect(&mut f.session, TransportRole::Send, dtls("BB"))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::InvalidState(_)));

        let connects = f
            .engine
            .calls()
            .iter()
            .filter(|c| matches!(c, EngineCall::ConnectTransport(_)))
            .count();
        assert_eq!(connects, 1);
    }

    #[tokio::test]
    async fn test_engine_connect_failure_keeps_created_state() {
        let mut f = fixture().await;
        f.orchestrator
            .request_transport(&mut f.session, &f.router_id, TransportRole::Send)
            .await
            .unwrap();
        f.engine.inject_failure(EngineOp::ConnectTransport, "dtls alert");

        let err = f
            .orchestrator
            .connect(&mut f.session, TransportRole::Send, dtls("AA"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "engine_error");
        assert_eq!(
            f.session.transport(TransportRole::Send).map(|t| t.state.clone()),
            Some(TransportState::Created)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_closes_transport() {
        let mut f = fixture().await;
        let created = f
            .orchestrator
            .request_transport(&mut f.session, &f.router_id, TransportRole::Recv)
            .await
            .unwrap();
        f.engine
            .inject_latency(EngineOp::ConnectTransport, Duration::from_secs(30));

        let err = f
            .orchestrator
            .connect(&mut f.session, TransportRole::Recv, dtls("AA"))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NegotiationTimeout(_)));
        assert!(f.session.transport(TransportRole::Recv).is_none());
        assert_eq!(closes_of(&f.engine, &created.params.id), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_timeout_closes_late_transport() {
        let mut f = fixture().await;
        f.engine
            .inject_latency(EngineOp::CreateTransport, Duration::from_secs(30));

        let err = f
            .orchestrator
            .request_transport(&mut f.session, &f.router_id, TransportRole::Send)
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::NegotiationTimeout(_)));
        assert!(f.session.transport(TransportRole::Send).is_none());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.engine.live_transports(), 0);
        assert!(f
            .engine
            .calls()
            .iter()
            .any(|c| matches!(c, EngineCall::CloseTransport(_))));
    }
}
