//! Router capability registry
//!
//! Read-only after the room's router is created; shared by every session in
//! the room without locking.

use crate::engine::RouterInfo;
use crate::rtp::RtpCapabilities;
use crate::types::RouterId;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    router_id: RouterId,
    capabilities: Arc<RtpCapabilities>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new(router: RouterInfo) -> Self {
        Self {
            router_id: router.id,
            capabilities: Arc::new(router.rtp_capabilities),
        }
    }

    #[must_use]
    pub fn router_id(&self) -> &RouterId {
        &self.router_id
    }

    #[must_use]
    pub fn capabilities(&self) -> &RtpCapabilities {
        &self.capabilities
    }
}
