//! Configuration for the mesh coordinator.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::protocol::DeviceAddress;
use crate::registry::TransportCapability;

/// Configuration for a [`MeshCoordinator`](crate::coordinator::MeshCoordinator).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Stable radio address of the local device.
    pub local_address: DeviceAddress,
    /// Display name advertised for the local device.
    pub local_name: String,
    /// Transports the local radio speaks.
    pub local_capability: TransportCapability,
    /// Whether discovery may dial out to devices flagged for auto-connect.
    pub auto_connect: bool,
    /// Capacity of the coordinator event broadcast channel.
    pub event_capacity: usize,
    /// Depth of the inbound frame queue feeding the router.
    pub inbound_queue: usize,
    /// Depth of the per-connection outbound frame queue.
    pub outbound_queue: usize,
    /// Upper bound on establishing a transport session. Remote responses are
    /// never timed out; this only bounds the link handshake itself.
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Pause between the classic scan finishing and the low-energy scan
    /// starting, letting the radio settle.
    #[serde(with = "humantime_serde")]
    pub scan_gap: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            local_address: String::new(),
            local_name: "tether".to_string(),
            local_capability: TransportCapability::Dual,
            auto_connect: true,
            event_capacity: 1024,
            inbound_queue: 256,
            outbound_queue: 64,
            handshake_timeout: Duration::from_secs(10),
            scan_gap: Duration::from_millis(100),
        }
    }
}

impl MeshConfig {
    /// Validate invariants the coordinator relies on.
    pub fn validate(&self) -> Result<()> {
        if self.local_address.is_empty() {
            return Err(Error::Config("local_address must not be empty".into()));
        }
        if self.event_capacity == 0 || self.inbound_queue == 0 || self.outbound_queue == 0 {
            return Err(Error::Config("channel capacities must be non-zero".into()));
        }
        Ok(())
    }
}
