//! Radio transport layer for the device mesh.
//!
//! Two link types are supported: a connection-oriented classic transport
//! carrying length-prefixed frames over a duplex stream, and an
//! advertisement/scan-based low-energy transport with a lighter session
//! primitive. The [`Radio`] trait is the seam to the platform radio stack;
//! [`memory`] provides an in-process implementation for testing and
//! development.

pub mod classic;
pub mod le;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::DeviceAddress;
use crate::registry::TransportCapability;

/// The two supported radio link types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    Classic,
    LowEnergy,
}

/// Which transports a discovery cycle should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportPreference {
    ClassicOnly,
    LowEnergyOnly,
    Both,
}

impl TransportPreference {
    pub fn includes(&self, kind: TransportKind) -> bool {
        match (self, kind) {
            (TransportPreference::Both, _) => true,
            (TransportPreference::ClassicOnly, TransportKind::Classic) => true,
            (TransportPreference::LowEnergyOnly, TransportKind::LowEnergy) => true,
            _ => false,
        }
    }
}

/// A device sighted during a scan, before capability resolution.
#[derive(Debug, Clone)]
pub struct FoundDevice {
    pub address: DeviceAddress,
    pub name: String,
    pub kind: TransportKind,
}

/// An unsolicited session initiated by a remote device.
pub struct IncomingLink {
    pub address: DeviceAddress,
    pub kind: TransportKind,
    pub session: Box<dyn LinkSession>,
}

/// One live transport session bound to exactly one device.
///
/// A session splits into independently owned halves: exactly one writer and
/// one dedicated read loop per connection, so per-session frame order is
/// preserved without shared locking.
pub trait LinkSession: Send {
    fn kind(&self) -> TransportKind;

    fn split(self: Box<Self>) -> (Box<dyn LinkWriter>, Box<dyn LinkReader>);
}

/// Outbound half of a link.
#[async_trait]
pub trait LinkWriter: Send {
    /// Write one frame. Errors mean the link is dead.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Close the link. Idempotent; ends the remote read loop.
    async fn close(&mut self) -> Result<()>;
}

/// Inbound half of a link.
#[async_trait]
pub trait LinkReader: Send {
    /// Next inbound frame; resolves to `None` once the link is closed by
    /// either side.
    async fn recv(&mut self) -> Result<Option<Bytes>>;
}

/// Seam to the platform radio stack.
#[async_trait]
pub trait Radio: Send + Sync {
    /// Begin a scan on one transport. Sighted devices stream through the
    /// receiver; the channel closing marks scan completion. Only one scan
    /// runs at a time.
    async fn start_scan(&self, kind: TransportKind) -> Result<mpsc::Receiver<FoundDevice>>;

    /// Cancel whichever scan is active. Idempotent; a no-op when idle.
    async fn cancel_scan(&self);

    /// Service-signature lookup resolving which transports a discovered
    /// device actually speaks.
    async fn resolve_capability(&self, address: &DeviceAddress) -> Result<TransportCapability>;

    /// Open a dedicated bidirectional classic session.
    async fn open_classic(&self, address: &DeviceAddress) -> Result<Box<dyn LinkSession>>;

    /// Establish a low-energy session via the transport's native connection
    /// primitive.
    async fn open_low_energy(&self, address: &DeviceAddress) -> Result<Box<dyn LinkSession>>;

    /// Stream of unsolicited inbound sessions. Yields the receiver once;
    /// later calls return `None`.
    async fn take_incoming(&self) -> Option<mpsc::Receiver<IncomingLink>>;
}
