//! Signaling message model
//!
//! JSON frames exchanged over the bidirectional signaling channel. Requests
//! carry a correlation id echoed in the response; notifications are
//! unsolicited server pushes.

use crate::engine::{ConsumerInfo, ConsumerType, DtlsParameters, IceCandidate, IceParameters, TransportInfo};
use crate::error::{Result, SfuError};
use crate::rtp::{RtpCapabilities, RtpParameters};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId, TransportRole};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw request frame before the payload is interpreted
#[derive(Debug, Clone, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    GetRouterRtpCapabilities,
    GetPeerId,
    GetProducers,
    CreateTransport {
        role: TransportRole,
    },
    ConnectTransport {
        role: TransportRole,
        dtls_parameters: DtlsParameters,
    },
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    ResumeConsumer {
        producer_id: ProducerId,
    },
}

#[derive(Deserialize)]
struct RolePayload {
    role: TransportRole,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectPayload {
    #[serde(default)]
    role: Option<TransportRole>,
    dtls_parameters: DtlsParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducePayload {
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConsumePayload {
    producer_id: ProducerId,
    rtp_capabilities: RtpCapabilities,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProducerRefPayload {
    producer_id: ProducerId,
}

fn payload<T: DeserializeOwned>(method: &str, data: Value) -> Result<T> {
    serde_json::from_value(data).map_err(|e| SfuError::InvalidRequest(format!("{method}: {e}")))
}

impl Request {
    /// Interpret a method name and its payload.
    ///
    /// The single-peer method names (`createProducerTransport`,
    /// `connectConsumerTransport`, `resume`, ...) are accepted as aliases
    /// that imply the transport role.
    pub fn parse(method: &str, data: Value) -> Result<Self> {
        let connect = |implied: Option<TransportRole>, data: Value| -> Result<Self> {
            let p: ConnectPayload = payload(method, data)?;
            let role = implied
                .or(p.role)
                .ok_or_else(|| SfuError::InvalidRequest(format!("{method}: missing field `role`")))?;
            Ok(Self::ConnectTransport {
                role,
                dtls_parameters: p.dtls_parameters,
            })
        };

        match method {
            "getRouterRtpCapabilities" => Ok(Self::GetRouterRtpCapabilities),
            "getPeerId" | "getSocketID" => Ok(Self::GetPeerId),
            "getProducers" => Ok(Self::GetProducers),
            "createTransport" => {
                let p: RolePayload = payload(method, data)?;
                Ok(Self::CreateTransport { role: p.role })
            }
            "createProducerTransport" => Ok(Self::CreateTransport {
                role: TransportRole::Send,
            }),
            "createConsumerTransport" => Ok(Self::CreateTransport {
                role: TransportRole::Recv,
            }),
            "connectTransport" => connect(None, data),
            "connectProducerTransport" => connect(Some(TransportRole::Send), data),
            "connectConsumerTransport" => connect(Some(TransportRole::Recv), data),
            "produce" => {
                let p: ProducePayload = payload(method, data)?;
                Ok(Self::Produce {
                    kind: p.kind,
                    rtp_parameters: p.rtp_parameters,
                })
            }
            "consume" => {
                let p: ConsumePayload = payload(method, data)?;
                Ok(Self::Consume {
                    producer_id: p.producer_id,
                    rtp_capabilities: p.rtp_capabilities,
                })
            }
            "resumeConsumer" | "resume" => {
                let p: ProducerRefPayload = payload(method, data)?;
                Ok(Self::ResumeConsumer {
                    producer_id: p.producer_id,
                })
            }
            other => Err(SfuError::InvalidRequest(format!("unknown method `{other}`"))),
        }
    }

    #[must_use]
    pub const fn method(&self) -> &'static str {
        match self {
            Self::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            Self::GetPeerId => "getPeerId",
            Self::GetProducers => "getProducers",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::ResumeConsumer { .. } => "resumeConsumer",
        }
    }
}

/// Wire-safe transport parameters handed back to the peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

impl From<TransportInfo> for TransportParams {
    fn from(info: TransportInfo) -> Self {
        Self {
            id: info.id,
            ice_parameters: info.ice_parameters,
            ice_candidates: info.ice_candidates,
            dtls_parameters: info.dtls_parameters,
        }
    }
}

/// Wire-safe consumer parameters handed back to the peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(rename = "type")]
    pub consumer_type: ConsumerType,
    pub producer_paused: bool,
}

impl From<ConsumerInfo> for ConsumerParams {
    fn from(info: ConsumerInfo) -> Self {
        Self {
            id: info.id,
            producer_id: info.producer_id,
            kind: info.kind,
            rtp_parameters: info.rtp_parameters,
            consumer_type: info.consumer_type,
            producer_paused: info.producer_paused,
        }
    }
}

/// A producer available in the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAnnouncement {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
}

/// Server-initiated events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "data", rename_all = "camelCase")]
pub enum Notification {
    NewProducer(ProducerAnnouncement),
    ProducerClosed(ProducerClosed),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl From<&SfuError> for ErrorPayload {
    fn from(err: &SfuError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub response: bool,
    pub id: u64,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl Response {
    #[must_use]
    pub fn success(id: u64, data: Option<Value>) -> Self {
        Self {
            response: true,
            id,
            ok: true,
            data,
            error: None,
        }
    }

    #[must_use]
    pub fn failure(id: u64, err: &SfuError) -> Self {
        Self {
            response: true,
            id,
            ok: false,
            data: None,
            error: Some(err.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationFrame {
    pub notification: bool,
    #[serde(flatten)]
    pub body: Notification,
}

/// Any frame the server writes to a peer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ServerMessage {
    Response(Response),
    Notification(NotificationFrame),
}

impl ServerMessage {
    #[must_use]
    pub fn notification(body: Notification) -> Self {
        Self::Notification(NotificationFrame {
            notification: true,
            body,
        })
    }

    pub fn to_json(&self) -> std::result::Result<String, String> {
        serde_json::to_string(self).map_err(|e| format!("Failed to encode server message: {e}"))
    }
}
