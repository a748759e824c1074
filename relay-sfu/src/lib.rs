//! Relay SFU signaling and session orchestration
//!
//! This crate negotiates WebRTC media sessions between peers and an external
//! SFU media engine. It never touches media packets: it creates transports,
//! producers and consumers in the engine and keeps every peer's view of them
//! consistent.
//!
//! ## Architecture
//!
//! - **`SfuManager`**: Rooms, sessions and the engine attachment
//! - **`SessionRegistry`**: One locked `PeerSession` per connected peer
//! - **`TransportOrchestrator`**: Send/receive transport lifecycle
//! - **`NegotiationCoordinator`**: Produce/consume flow and room fan-out
//! - **`MediaGateway`**: Timeouts and best-effort paths over a `MediaEngine`
//! - **`SignalingDispatcher`**: Wire protocol and per-connection loop
//!
//! ## Usage
//!
//! ```rust,ignore
//! use relay_sfu::{MemoryEngine, SfuConfig, SfuManager, SignalingDispatcher};
//!
//! let config = SfuConfig::default();
//! let manager = SfuManager::new(config.clone());
//! manager.attach_engine(Arc::new(MemoryEngine::new(config.rtc_min_port, config.rtc_max_port)));
//!
//! let dispatcher = SignalingDispatcher::new(manager);
//! dispatcher.run(&mut stream, RoomId::from("lobby"), PeerId::generate()).await?;
//! ```

pub mod capabilities;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod room;
pub mod rtp;
pub mod session;
pub mod signaling;
pub mod transport;
pub mod types;

pub use config::{ConsumerLayers, SfuConfig, WebRtcTransportConfig};
pub use dispatcher::{SignalingDispatcher, SignalingStream};
pub use engine::memory::MemoryEngine;
pub use engine::MediaEngine;
pub use error::{EngineError, Result, SfuError};
pub use manager::{ManagerStats, SfuManager};
pub use room::{RoomStats, SfuRoom};
pub use signaling::{Notification, ServerMessage};
pub use types::{MediaKind, PeerId, RoomId, TransportRole};
