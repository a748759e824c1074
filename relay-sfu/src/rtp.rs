//! RTP capability and parameter model
//!
//! Shapes follow the ORTC dictionaries browsers exchange during negotiation
//! (camelCase on the wire). The router capabilities are derived from the
//! configured media codec table; a remote peer's capabilities are checked
//! against a producer's RTP parameters before a consumer may be created.

use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// First dynamic payload type handed out to router codecs
const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;

const MID_EXTENSION_URI: &str = "urn:ietf:params:rtp-hdrext:sdes:mid";
const ABS_SEND_TIME_URI: &str = "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";
const TRANSPORT_CC_URI: &str =
    "http://www.ietf.org/id/draft-holmer-rmcat-transport-wide-cc-extensions-01";
const AUDIO_LEVEL_URI: &str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parameter: String,
}

impl RtcpFeedback {
    fn new(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: parameter.to_string(),
        }
    }
}

/// A codec the router (or a remote endpoint) is able to send or receive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecCapability {
    /// Whether this is a retransmission pseudo-codec
    #[must_use]
    pub fn is_rtx(&self) -> bool {
        is_rtx_mime(&self.mime_type)
    }

    /// Codec identity match: MIME type (case-insensitive), clock rate and,
    /// for audio, channel count (absent means mono).
    #[must_use]
    pub fn matches(&self, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(mime_type) || self.clock_rate != clock_rate {
            return false;
        }
        match self.kind {
            MediaKind::Audio => self.channels.unwrap_or(1) == channels.unwrap_or(1),
            MediaKind::Video => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtension {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MediaKind>,
    pub uri: String,
    pub preferred_id: u16,
    #[serde(default)]
    pub preferred_encrypt: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// Codecs and header extensions supported by an endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtension>,
}

impl RtpCapabilities {
    /// Derive router capabilities from a media codec table.
    ///
    /// Payload types are assigned from the dynamic range unless the entry
    /// carries one, default RTCP feedback is attached, and every video codec
    /// gets an RTX companion pointing at it via `apt`.
    pub fn from_media_codecs(media_codecs: &[RtpCodecCapability]) -> Result<Self, String> {
        if media_codecs.is_empty() {
            return Err("media codec table is empty".to_string());
        }

        let mut taken: Vec<u8> = media_codecs
            .iter()
            .filter_map(|c| c.preferred_payload_type)
            .collect();
        let mut next_pt = DYNAMIC_PAYLOAD_TYPE_START;
        let mut allocate = |taken: &mut Vec<u8>| -> Result<u8, String> {
            while taken.contains(&next_pt) {
                next_pt = next_pt
                    .checked_add(1)
                    .filter(|pt| *pt <= 127)
                    .ok_or_else(|| "dynamic payload types exhausted".to_string())?;
            }
            taken.push(next_pt);
            Ok(next_pt)
        };

        let mut codecs = Vec::with_capacity(media_codecs.len() * 2);
        for codec in media_codecs {
            if codec.is_rtx() {
                return Err(format!("{} must not be listed explicitly", codec.mime_type));
            }
            if !codec
                .mime_type
                .to_ascii_lowercase()
                .starts_with(codec.kind.mime_prefix())
            {
                return Err(format!(
                    "codec {} does not match kind {}",
                    codec.mime_type, codec.kind
                ));
            }

            let mut entry = codec.clone();
            let payload_type = match entry.preferred_payload_type {
                Some(pt) => pt,
                None => allocate(&mut taken)?,
            };
            entry.preferred_payload_type = Some(payload_type);
            if entry.kind == MediaKind::Audio && entry.channels.is_none() {
                entry.channels = Some(1);
            }
            if entry.rtcp_feedback.is_empty() {
                entry.rtcp_feedback = default_feedback(entry.kind);
            }
            codecs.push(entry);

            if codec.kind == MediaKind::Video {
                let mut parameters = Map::new();
                parameters.insert("apt".to_string(), Value::from(payload_type));
                codecs.push(Self::rtx_codec(codec.clock_rate, allocate(&mut taken)?, parameters));
            }
        }

        Ok(Self {
            codecs,
            header_extensions: default_header_extensions(),
        })
    }

    fn rtx_codec(clock_rate: u32, payload_type: u8, parameters: Map<String, Value>) -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/rtx".to_string(),
            preferred_payload_type: Some(payload_type),
            clock_rate,
            channels: None,
            parameters,
            rtcp_feedback: Vec::new(),
        }
    }

    /// First non-RTX codec in these capabilities matching `codec`
    #[must_use]
    pub fn find_matching(&self, codec: &RtpCodecParameters) -> Option<&RtpCodecCapability> {
        self.codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .find(|c| c.matches(&codec.mime_type, codec.clock_rate, codec.channels))
    }

    /// Whether an endpoint with these capabilities can receive a stream
    /// described by `params`: at least one media codec must be supported.
    #[must_use]
    pub fn can_consume(&self, params: &RtpParameters) -> bool {
        params
            .codecs
            .iter()
            .filter(|c| !c.is_rtx())
            .any(|c| self.find_matching(c).is_some())
    }
}

fn default_feedback(kind: MediaKind) -> Vec<RtcpFeedback> {
    match kind {
        MediaKind::Audio => vec![RtcpFeedback::new("transport-cc", "")],
        MediaKind::Video => vec![
            RtcpFeedback::new("nack", ""),
            RtcpFeedback::new("nack", "pli"),
            RtcpFeedback::new("ccm", "fir"),
            RtcpFeedback::new("goog-remb", ""),
            RtcpFeedback::new("transport-cc", ""),
        ],
    }
}

fn default_header_extensions() -> Vec<RtpHeaderExtension> {
    let ext = |kind: MediaKind, uri: &str, id: u16| RtpHeaderExtension {
        kind: Some(kind),
        uri: uri.to_string(),
        preferred_id: id,
        preferred_encrypt: false,
        direction: Some("sendrecv".to_string()),
    };
    vec![
        ext(MediaKind::Audio, MID_EXTENSION_URI, 1),
        ext(MediaKind::Video, MID_EXTENSION_URI, 1),
        ext(MediaKind::Audio, ABS_SEND_TIME_URI, 4),
        ext(MediaKind::Video, ABS_SEND_TIME_URI, 4),
        ext(MediaKind::Video, TRANSPORT_CC_URI, 5),
        ext(MediaKind::Audio, AUDIO_LEVEL_URI, 10),
    ]
}

fn is_rtx_mime(mime_type: &str) -> bool {
    mime_type.to_ascii_lowercase().ends_with("/rtx")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

impl RtpCodecParameters {
    #[must_use]
    pub fn is_rtx(&self) -> bool {
        is_rtx_mime(&self.mime_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssrc: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtx: Option<RtxParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scalability_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtx: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpHeaderExtensionParameters {
    pub uri: String,
    pub id: u16,
    #[serde(default)]
    pub encrypt: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cname: Option<String>,
    #[serde(default = "default_reduced_size")]
    pub reduced_size: bool,
}

impl Default for RtcpParameters {
    fn default() -> Self {
        Self {
            cname: None,
            reduced_size: true,
        }
    }
}

const fn default_reduced_size() -> bool {
    true
}

/// Describes how a media stream is packetized
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<RtpHeaderExtensionParameters>,
    #[serde(default)]
    pub encodings: Vec<RtpEncodingParameters>,
    #[serde(default)]
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// Multiple encodings of the same source means simulcast
    #[must_use]
    pub fn is_simulcast(&self) -> bool {
        self.encodings.len() > 1
    }

    /// Structural checks applied before a producer is accepted
    pub fn validate(&self, kind: MediaKind) -> Result<(), String> {
        let media: Vec<_> = self.codecs.iter().filter(|c| !c.is_rtx()).collect();
        if media.is_empty() {
            return Err("rtpParameters carry no media codec".to_string());
        }
        if let Some(codec) = media
            .iter()
            .find(|c| !c.mime_type.to_ascii_lowercase().starts_with(kind.mime_prefix()))
        {
            return Err(format!("codec {} does not match kind {kind}", codec.mime_type));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opus() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    fn vp8() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    fn params(mime: &str, clock_rate: u32, channels: Option<u8>) -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: mime.to_string(),
                payload_type: 111,
                clock_rate,
                channels,
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_router_capabilities_assign_payload_types_and_rtx() {
        let caps = RtpCapabilities::from_media_codecs(&[opus(), vp8()]).unwrap();

        assert_eq!(caps.codecs.len(), 3);
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(100));
        assert_eq!(caps.codecs[1].preferred_payload_type, Some(101));
        let rtx = &caps.codecs[2];
        assert!(rtx.is_rtx());
        assert_eq!(rtx.parameters.get("apt"), Some(&Value::from(101)));
        assert!(!caps.codecs[1].rtcp_feedback.is_empty());
        assert!(!caps.header_extensions.is_empty());
    }

    #[test]
    fn test_router_capabilities_reject_bad_tables() {
        assert!(RtpCapabilities::from_media_codecs(&[]).is_err());

        let mut mislabeled = opus();
        mislabeled.kind = MediaKind::Video;
        assert!(RtpCapabilities::from_media_codecs(&[mislabeled]).is_err());
    }

    #[test]
    fn test_explicit_payload_type_is_not_reused() {
        let mut fixed = vp8();
        fixed.preferred_payload_type = Some(100);
        let caps = RtpCapabilities::from_media_codecs(&[fixed, opus()]).unwrap();
        let pts: Vec<_> = caps.codecs.iter().filter_map(|c| c.preferred_payload_type).collect();
        assert_eq!(pts, vec![100, 101, 102]);
    }

    #[test]
    fn test_can_consume_matches_codec_identity() {
        let caps = RtpCapabilities::from_media_codecs(&[opus(), vp8()]).unwrap();

        assert!(caps.can_consume(&params("audio/OPUS", 48000, Some(2))));
        assert!(caps.can_consume(&params("video/vp8", 90000, None)));
        assert!(!caps.can_consume(&params("audio/opus", 48000, Some(1))));
        assert!(!caps.can_consume(&params("video/H264", 90000, None)));
        assert!(!RtpCapabilities::default().can_consume(&params("audio/opus", 48000, Some(2))));
    }

    #[test]
    fn test_validate_rejects_kind_mismatch() {
        let audio = params("audio/opus", 48000, Some(2));
        assert!(audio.validate(MediaKind::Audio).is_ok());
        assert!(audio.validate(MediaKind::Video).is_err());
        assert!(RtpParameters::default().validate(MediaKind::Audio).is_err());
    }

    #[test]
    fn test_wire_shape_is_camel_case() {
        let json = serde_json::json!({
            "codecs": [{"mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000}],
            "encodings": [{"rid": "l"}, {"rid": "m"}, {"rid": "h", "scalabilityMode": "L1T3"}]
        });
        let parsed: RtpParameters = serde_json::from_value(json).unwrap();
        assert!(parsed.is_simulcast());
        assert!(parsed.rtcp.reduced_size);
        assert_eq!(parsed.encodings[2].scalability_mode.as_deref(), Some("L1T3"));
    }
}
