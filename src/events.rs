//! Coordinator event broadcasting.
//!
//! Replaces the OS-level broadcast bus of classic mesh daemons with an
//! explicit publish/subscribe channel internal to the coordinator. Client
//! sessions subscribe through the local session API.

use tokio::sync::broadcast;

use crate::registry::Device;

/// State-change topics broadcast from the coordinator to bound sessions.
///
/// Each variant carries the affected device where one applies.
#[derive(Debug, Clone)]
pub enum MeshEvent {
    DeviceDiscovered(Device),
    DeviceConnected(Device),
    DeviceDisconnected(Device),
    DeviceIdentityChanged(Device),
    DiscoveryStarted,
    DiscoveryFinished,
    ConfigurationChanged,
    /// An unsolicited inbound link arrived from a device we never dialed.
    /// The link stays parked until the user approves or rejects it.
    ConnectionConfirmationRequired(Device),
}

/// Broadcast fan-out for [`MeshEvent`].
///
/// Cheap to clone; every component holds one and publishes directly.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<MeshEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers.
    ///
    /// A bus with no subscribers swallows the event; state broadcasting is
    /// best-effort by design.
    pub fn publish(&self, event: MeshEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
