//! Envelope routing between local apps and connected devices.
//!
//! Outbound, an envelope is encoded exactly once; a broadcast hands the same
//! bytes to every open connection, a directed send to one. There is no
//! store-and-forward: a destination without an open connection is a logged
//! no-op. Inbound, malformed and spoofed frames are dropped without touching
//! the connection; surviving envelopes are handed to the caller for local
//! dispatch.

use std::sync::Arc;

use log::{debug, warn};

use crate::connection::{ConnectionManager, InboundFrame};
use crate::error::Result;
use crate::protocol::Envelope;
use crate::registry::DeviceRegistry;

pub struct MessageRouter {
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
}

impl MessageRouter {
    pub fn new(registry: Arc<DeviceRegistry>, connections: Arc<ConnectionManager>) -> Self {
        Self {
            registry,
            connections,
        }
    }

    /// Send one envelope toward its destination device(s).
    ///
    /// The body is encoded once; broadcasts fan the identical bytes out to
    /// every open connection. Unreachable destinations are logged, not
    /// returned: delivery is best effort.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let frame = envelope.to_bytes()?;

        match &envelope.dest_device_address {
            None => {
                self.connections.broadcast_frame(frame).await;
            }
            Some(dest) => {
                if let Err(e) = self.connections.send_frame(dest, frame).await {
                    warn!("send to {dest} dropped: {e}");
                }
            }
        }
        Ok(())
    }

    /// Validate one inbound frame and decode it for local dispatch.
    ///
    /// Returns `None` for frames the mesh must ignore: malformed bodies,
    /// envelopes whose embedded source does not match the link they arrived
    /// on, and envelopes addressed to some other device (no multi-hop
    /// forwarding).
    pub fn on_receive(&self, inbound: &InboundFrame) -> Option<Envelope> {
        let envelope = match Envelope::from_bytes(&inbound.frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("dropping malformed frame from {}: {e}", inbound.from);
                return None;
            }
        };

        if envelope.source_device_address != inbound.from {
            warn!(
                "dropping spoofed frame: claims {} but arrived from {}",
                envelope.source_device_address, inbound.from
            );
            return None;
        }

        if let Some(dest) = &envelope.dest_device_address {
            if dest != self.registry.local_address() {
                debug!("ignoring envelope addressed to {dest}");
                return None;
            }
        }

        Some(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::events::EventBus;
    use crate::protocol::MESSAGE_TYPE_DATA;
    use crate::registry::TransportCapability;
    use crate::transport::memory::MemoryHub;
    use crate::transport::TransportKind;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct Node {
        registry: Arc<DeviceRegistry>,
        manager: Arc<ConnectionManager>,
        router: MessageRouter,
        inbound: mpsc::Receiver<InboundFrame>,
    }

    async fn node(hub: &Arc<MemoryHub>, address: &str) -> Node {
        let events = EventBus::new(64);
        let registry = Arc::new(DeviceRegistry::new(
            address.to_string(),
            address.to_lowercase(),
            TransportCapability::Dual,
            events.clone(),
        ));
        let radio = Arc::new(hub.join(address, address.to_lowercase(), TransportCapability::Dual));
        let config = MeshConfig {
            local_address: address.to_string(),
            ..Default::default()
        };
        let (manager, inbound) =
            ConnectionManager::new(Arc::clone(&registry), radio, events, &config);
        manager.start().await;
        let router = MessageRouter::new(Arc::clone(&registry), Arc::clone(&manager));
        Node {
            registry,
            manager,
            router,
            inbound,
        }
    }

    fn envelope(from: &str, to: Option<&str>) -> Envelope {
        let mut builder = Envelope::builder()
            .source_device(from)
            .source_app("com.example.alpha")
            .kind(MESSAGE_TYPE_DATA)
            .payload("{\"n\":1}");
        if let Some(to) = to {
            builder = builder.dest_device(to);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn broadcast_reaches_every_connection_with_identical_bytes() {
        let hub = MemoryHub::new();
        let a = node(&hub, "A").await;
        let mut b = node(&hub, "B").await;
        let mut c = node(&hub, "C").await;
        b.registry.set_auto_connect(&"A".to_string(), true).await;
        c.registry.set_auto_connect(&"A".to_string(), true).await;
        a.manager.connect(&"B".to_string(), TransportKind::Classic).await;
        a.manager.connect(&"C".to_string(), TransportKind::LowEnergy).await;

        a.router.send(&envelope("A", None)).await.unwrap();

        let at_b = timeout(WAIT, b.inbound.recv()).await.unwrap().unwrap();
        let at_c = timeout(WAIT, c.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(at_b.frame, at_c.frame);
        assert_eq!(
            b.router.on_receive(&at_b).unwrap(),
            c.router.on_receive(&at_c).unwrap()
        );
    }

    #[tokio::test]
    async fn directed_send_without_a_connection_is_a_no_op() {
        let hub = MemoryHub::new();
        let a = node(&hub, "A").await;
        assert!(a.router.send(&envelope("A", Some("GONE"))).await.is_ok());
    }

    #[tokio::test]
    async fn receive_drops_malformed_spoofed_and_misaddressed_frames() {
        let hub = MemoryHub::new();
        let b = node(&hub, "B").await;

        let malformed = InboundFrame {
            from: "A".to_string(),
            frame: Bytes::from_static(b"{broken"),
        };
        assert!(b.router.on_receive(&malformed).is_none());

        let spoofed = InboundFrame {
            from: "A".to_string(),
            frame: envelope("X", Some("B")).to_bytes().unwrap(),
        };
        assert!(b.router.on_receive(&spoofed).is_none());

        let misaddressed = InboundFrame {
            from: "A".to_string(),
            frame: envelope("A", Some("C")).to_bytes().unwrap(),
        };
        assert!(b.router.on_receive(&misaddressed).is_none());

        let good = InboundFrame {
            from: "A".to_string(),
            frame: envelope("A", Some("B")).to_bytes().unwrap(),
        };
        assert_eq!(
            b.router.on_receive(&good).unwrap().source_device_address,
            "A"
        );
    }
}
