//! SFU Configuration

use crate::rtp::RtpCodecCapability;
use crate::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};

/// SFU configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SfuConfig {
    /// Maximum number of concurrent rooms (0 = unlimited)
    pub max_rooms: usize,
    /// Maximum peers per room (0 = unlimited)
    pub max_peers_per_room: usize,
    /// Router codec table, shared by every room
    pub media_codecs: Vec<RtpCodecCapability>,
    /// Lowest RTC port handed to the media engine
    pub rtc_min_port: u16,
    /// Highest RTC port handed to the media engine
    pub rtc_max_port: u16,
    pub webrtc_transport: WebRtcTransportConfig,
    /// Upper bound for createTransport / connectTransport round-trips
    pub negotiation_timeout_ms: u64,
    /// Simulcast layers selected for every new simulcast consumer
    pub preferred_layers: ConsumerLayers,
    /// Depth of each peer's outbound notification queue
    pub notification_buffer: usize,
}

impl SfuConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Validate the configuration, collecting every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.media_codecs.is_empty() {
            errors.push("sfu.media_codecs must not be empty".to_string());
        }
        for codec in &self.media_codecs {
            if !codec
                .mime_type
                .to_ascii_lowercase()
                .starts_with(codec.kind.mime_prefix())
            {
                errors.push(format!(
                    "sfu.media_codecs: {} is not a {} codec",
                    codec.mime_type, codec.kind
                ));
            }
        }
        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "sfu.rtc_min_port ({}) must not exceed sfu.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.webrtc_transport.listen_ips.is_empty() {
            errors.push("sfu.webrtc_transport.listen_ips must not be empty".to_string());
        }
        if !self.webrtc_transport.enable_udp && !self.webrtc_transport.enable_tcp {
            errors.push("sfu.webrtc_transport must enable udp or tcp".to_string());
        }
        if self.negotiation_timeout_ms == 0 {
            errors.push("sfu.negotiation_timeout_ms must be positive".to_string());
        }
        if self.notification_buffer == 0 {
            errors.push("sfu.notification_buffer must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Default for SfuConfig {
    fn default() -> Self {
        let mut vp8_parameters = Map::new();
        vp8_parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

        Self {
            max_rooms: 0,
            max_peers_per_room: 50,
            media_codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: MIME_TYPE_OPUS.to_string(),
                    preferred_payload_type: None,
                    clock_rate: 48000,
                    channels: Some(2),
                    parameters: Map::new(),
                    rtcp_feedback: Vec::new(),
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: MIME_TYPE_VP8.to_string(),
                    preferred_payload_type: None,
                    clock_rate: 90000,
                    channels: None,
                    parameters: vp8_parameters,
                    rtcp_feedback: Vec::new(),
                },
            ],
            rtc_min_port: 20000,
            rtc_max_port: 29999,
            webrtc_transport: WebRtcTransportConfig::default(),
            negotiation_timeout_ms: 10_000,
            preferred_layers: ConsumerLayers::HIGHEST,
            notification_buffer: 256,
        }
    }
}

/// Options applied to every WebRTC transport the engine creates
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportConfig {
    pub listen_ips: Vec<String>,
    /// Public address advertised in ICE candidates (behind NAT)
    pub announced_ip: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    /// Initial outgoing bitrate estimate (bps)
    pub initial_available_outgoing_bitrate: u32,
    /// Incoming bitrate ceiling (bps, 0 = no ceiling)
    pub max_incoming_bitrate: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ips: vec!["0.0.0.0".to_string()],
            announced_ip: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: 1_500_000,
        }
    }
}

/// Spatial/temporal layer pair for simulcast/SVC consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerLayers {
    #[serde(alias = "spatialLayer")]
    pub spatial: u8,
    #[serde(alias = "temporalLayer")]
    pub temporal: u8,
}

impl ConsumerLayers {
    pub const HIGHEST: Self = Self {
        spatial: 2,
        temporal: 2,
    };
}

impl Default for ConsumerLayers {
    fn default() -> Self {
        Self::HIGHEST
    }
}
