//! Connection lifecycle management.
//!
//! Owns every live link: dial-out with a bounded handshake, acceptance of
//! unsolicited inbound links (parked until the user confirms them, unless the
//! device is trusted), and teardown. Each connection gets exactly one writer
//! task draining a bounded outbound queue and one dedicated read loop pushing
//! frames into the shared inbound queue, so per-link frame order is
//! preserved without locking around the transport.
//!
//! Dial failures are not errors to the caller: the mesh treats an
//! unreachable device as a state to report, not a fault to propagate.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::events::{EventBus, MeshEvent};
use crate::protocol::DeviceAddress;
use crate::registry::DeviceRegistry;
use crate::transport::{IncomingLink, LinkSession, Radio, TransportKind};

/// One frame received from a connected device.
#[derive(Debug)]
pub struct InboundFrame {
    pub from: DeviceAddress,
    pub frame: Bytes,
}

struct Connection {
    kind: TransportKind,
    out_tx: mpsc::Sender<Bytes>,
    writer_task: JoinHandle<()>,
    reader_task: JoinHandle<()>,
}

/// Tracks and owns all live links.
pub struct ConnectionManager {
    registry: Arc<DeviceRegistry>,
    radio: Arc<dyn Radio>,
    events: EventBus,
    connections: RwLock<HashMap<DeviceAddress, Connection>>,
    /// Unsolicited links waiting for user confirmation.
    pending: AsyncMutex<HashMap<DeviceAddress, IncomingLink>>,
    /// Addresses we initiated a connection to. An inbound link from one of
    /// these is the other half of our own request and skips confirmation.
    expected: AsyncMutex<HashSet<DeviceAddress>>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    handshake_timeout: Duration,
    outbound_queue: usize,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    me: Weak<Self>,
}

impl ConnectionManager {
    /// Build the manager and hand back the inbound frame queue the router
    /// consumes.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        radio: Arc<dyn Radio>,
        events: EventBus,
        config: &MeshConfig,
    ) -> (Arc<Self>, mpsc::Receiver<InboundFrame>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let manager = Arc::new_cyclic(|me| Self {
            registry,
            radio,
            events,
            connections: RwLock::new(HashMap::new()),
            pending: AsyncMutex::new(HashMap::new()),
            expected: AsyncMutex::new(HashSet::new()),
            inbound_tx,
            handshake_timeout: config.handshake_timeout,
            outbound_queue: config.outbound_queue,
            accept_task: Mutex::new(None),
            me: me.clone(),
        });
        (manager, inbound_rx)
    }

    /// Start accepting unsolicited inbound links from the radio.
    pub async fn start(&self) {
        let Some(mut incoming) = self.radio.take_incoming().await else {
            warn!("radio incoming stream already taken; accept loop not started");
            return;
        };

        let me = self.me.clone();
        let task = tokio::spawn(async move {
            while let Some(link) = incoming.recv().await {
                let Some(manager) = me.upgrade() else { break };
                manager.handle_incoming(link).await;
            }
        });
        *self.accept_task.lock().unwrap() = Some(task);
    }

    /// Dial a device over one transport.
    ///
    /// Already-connected and already-connecting addresses are a no-op. A
    /// failed or timed-out dial is logged and reported through device state,
    /// not returned as an error.
    pub async fn connect(&self, address: &DeviceAddress, kind: TransportKind) {
        if self.is_connected(address).await {
            debug!("connect {address}: already connected");
            return;
        }
        {
            let mut expected = self.expected.lock().await;
            if !expected.insert(address.clone()) {
                debug!("connect {address}: already in progress");
                return;
            }
        }

        // A parked inbound link from the same device is the connection we
        // want; adopt it instead of dialing a second one.
        if let Some(link) = self.pending.lock().await.remove(address) {
            info!("connect {address}: adopting the parked inbound link");
            self.install(address.clone(), link.kind, link.session).await;
            return;
        }

        let dial = async {
            match kind {
                TransportKind::Classic => self.radio.open_classic(address).await,
                TransportKind::LowEnergy => self.radio.open_low_energy(address).await,
            }
        };

        match tokio::time::timeout(self.handshake_timeout, dial).await {
            Ok(Ok(session)) => {
                info!("connected to {address} over {kind:?}");
                self.install(address.clone(), kind, session).await;
            }
            Ok(Err(e)) => {
                warn!("connect {address} over {kind:?} failed: {e}");
                self.expected.lock().await.remove(address);
            }
            Err(_) => {
                warn!(
                    "connect {address} over {kind:?} timed out after {:?}",
                    self.handshake_timeout
                );
                self.expected.lock().await.remove(address);
            }
        }
    }

    /// Tear down the link to one device. A no-op when not connected.
    pub async fn disconnect(&self, address: &DeviceAddress) {
        let Some(conn) = self.connections.write().await.remove(address) else {
            return;
        };

        // Dropping the outbound sender ends the writer loop, which closes the
        // link and lets the remote read loop wind down on EOF. The local read
        // loop may be blocked on a half-open stream, so stop it directly.
        drop(conn.out_tx);
        let _ = conn.writer_task.await;
        conn.reader_task.abort();
        let _ = conn.reader_task.await;

        self.finish_link(address).await;
    }

    /// Accept a parked unsolicited link.
    pub async fn approve(&self, address: &DeviceAddress) -> Result<()> {
        let link = self
            .pending
            .lock()
            .await
            .remove(address)
            .ok_or_else(|| Error::Transport(format!("no pending connection from {address}")))?;
        info!("inbound connection from {address} approved");
        self.install(address.clone(), link.kind, link.session).await;
        Ok(())
    }

    /// Drop a parked unsolicited link without connecting.
    pub async fn reject(&self, address: &DeviceAddress) -> Result<()> {
        let link = self
            .pending
            .lock()
            .await
            .remove(address)
            .ok_or_else(|| Error::Transport(format!("no pending connection from {address}")))?;
        info!("inbound connection from {address} rejected");
        let (mut writer, _reader) = link.session.split();
        let _ = writer.close().await;
        Ok(())
    }

    pub async fn is_connected(&self, address: &DeviceAddress) -> bool {
        self.connections.read().await.contains_key(address)
    }

    /// Transport carrying the live link to `address`, if any.
    pub async fn link_kind(&self, address: &DeviceAddress) -> Option<TransportKind> {
        self.connections.read().await.get(address).map(|c| c.kind)
    }

    /// Queue one frame for a connected device.
    pub async fn send_frame(&self, address: &DeviceAddress, frame: Bytes) -> Result<()> {
        let tx = {
            let connections = self.connections.read().await;
            connections
                .get(address)
                .map(|c| c.out_tx.clone())
                .ok_or_else(|| Error::Transport(format!("no connection to {address}")))?
        };
        tx.send(frame)
            .await
            .map_err(|_| Error::Channel(format!("outbound queue to {address} closed")))
    }

    /// Queue one frame for every connected device. Individual dead links are
    /// logged and skipped.
    pub async fn broadcast_frame(&self, frame: Bytes) {
        let targets: Vec<(DeviceAddress, mpsc::Sender<Bytes>)> = {
            let connections = self.connections.read().await;
            connections
                .iter()
                .map(|(address, c)| (address.clone(), c.out_tx.clone()))
                .collect()
        };
        let sends = targets.into_iter().map(|(address, tx)| {
            let frame = frame.clone();
            async move {
                if tx.send(frame).await.is_err() {
                    debug!("broadcast skipped {address}: outbound queue closed");
                }
            }
        });
        futures::future::join_all(sends).await;
    }

    /// Drop every link and stop the accept loop.
    pub async fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().unwrap().take() {
            task.abort();
        }
        let addresses: Vec<DeviceAddress> =
            self.connections.read().await.keys().cloned().collect();
        for address in addresses {
            self.disconnect(&address).await;
        }
    }

    async fn handle_incoming(&self, link: IncomingLink) {
        let address = link.address.clone();
        if self.is_connected(&address).await {
            debug!("dropping duplicate inbound link from {address}");
            return;
        }

        let device = self.registry.get_or_placeholder(&address).await;
        let trusted = {
            let expected = self.expected.lock().await;
            expected.contains(&address) || device.bonded || device.auto_connect
        };

        if trusted {
            info!("accepted inbound link from {address} over {:?}", link.kind);
            self.install(address, link.kind, link.session).await;
        } else {
            info!("inbound link from {address} needs confirmation");
            self.pending.lock().await.insert(address, link);
            self.events
                .publish(MeshEvent::ConnectionConfirmationRequired(device));
        }
    }

    async fn install(
        &self,
        address: DeviceAddress,
        kind: TransportKind,
        session: Box<dyn LinkSession>,
    ) {
        let (mut writer, mut reader) = session.split();
        let (out_tx, mut out_rx) = mpsc::channel::<Bytes>(self.outbound_queue);

        let writer_peer = address.clone();
        let writer_task = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = writer.send(frame).await {
                    warn!("write to {writer_peer} failed: {e}");
                    break;
                }
            }
            let _ = writer.close().await;
        });

        let me = self.me.clone();
        let reader_peer = address.clone();
        let inbound_tx = self.inbound_tx.clone();
        let reader_task = tokio::spawn(async move {
            loop {
                match reader.recv().await {
                    Ok(Some(frame)) => {
                        let inbound = InboundFrame {
                            from: reader_peer.clone(),
                            frame,
                        };
                        if inbound_tx.send(inbound).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!("link to {reader_peer} closed by the remote");
                        break;
                    }
                    Err(e) => {
                        warn!("read from {reader_peer} failed: {e}");
                        break;
                    }
                }
            }
            if let Some(manager) = me.upgrade() {
                manager.finish_link(&reader_peer).await;
            }
        });

        self.connections.write().await.insert(
            address.clone(),
            Connection {
                kind,
                out_tx,
                writer_task,
                reader_task,
            },
        );
        self.registry.set_connected(&address, true).await;
    }

    /// Idempotent post-teardown bookkeeping shared by every exit path.
    async fn finish_link(&self, address: &DeviceAddress) {
        self.connections.write().await.remove(address);
        self.expected.lock().await.remove(address);
        self.registry.set_connected(address, false).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TransportCapability;
    use crate::transport::memory::MemoryHub;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct Node {
        registry: Arc<DeviceRegistry>,
        manager: Arc<ConnectionManager>,
        inbound: mpsc::Receiver<InboundFrame>,
        events: EventBus,
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
            handshake_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        let (manager, inbound) =
            ConnectionManager::new(Arc::clone(&registry), radio, events.clone(), &config);
        manager.start().await;
        Node {
            registry,
            manager,
            inbound,
            events,
        }
    }

    async fn next_event(
        rx: &mut tokio::sync::broadcast::Receiver<MeshEvent>,
        want: fn(&MeshEvent) -> bool,
    ) -> MeshEvent {
        timeout(WAIT, async {
            loop {
                let event = rx.recv().await.unwrap();
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("event did not arrive")
    }

    #[tokio::test]
    async fn dialing_a_trusted_device_routes_frames_both_ways() {
        let hub = MemoryHub::new();
        let mut a = node(&hub, "A").await;
        let mut b = node(&hub, "B").await;
        b.registry.set_auto_connect(&"A".to_string(), true).await;

        a.manager.connect(&"B".to_string(), TransportKind::Classic).await;
        assert!(a.manager.is_connected(&"B".to_string()).await);

        a.manager
            .send_frame(&"B".to_string(), Bytes::from_static(b"to-b"))
            .await
            .unwrap();
        let got = timeout(WAIT, b.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(got.from, "A");
        assert_eq!(got.frame, "to-b");

        b.manager
            .send_frame(&"A".to_string(), Bytes::from_static(b"to-a"))
            .await
            .unwrap();
        let got = timeout(WAIT, a.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(got.from, "B");
        assert_eq!(got.frame, "to-a");
    }

    #[tokio::test]
    async fn unsolicited_links_park_until_approved() {
        let hub = MemoryHub::new();
        let mut a = node(&hub, "A").await;
        let b = node(&hub, "B").await;
        let mut b_events = b.events.subscribe();

        a.manager.connect(&"B".to_string(), TransportKind::Classic).await;

        let event = next_event(&mut b_events, |e| {
            matches!(e, MeshEvent::ConnectionConfirmationRequired(_))
        })
        .await;
        let MeshEvent::ConnectionConfirmationRequired(device) = event else {
            unreachable!()
        };
        assert_eq!(device.address, "A");
        assert!(!b.manager.is_connected(&"A".to_string()).await);

        b.manager.approve(&"A".to_string()).await.unwrap();
        assert!(b.manager.is_connected(&"A".to_string()).await);

        b.manager
            .send_frame(&"A".to_string(), Bytes::from_static(b"approved"))
            .await
            .unwrap();
        let got = timeout(WAIT, a.inbound.recv()).await.unwrap().unwrap();
        assert_eq!(got.frame, "approved");
    }

    #[tokio::test]
    async fn rejecting_a_parked_link_leaves_nothing_behind() {
        let hub = MemoryHub::new();
        let a = node(&hub, "A").await;
        let b = node(&hub, "B").await;
        let mut b_events = b.events.subscribe();

        a.manager.connect(&"B".to_string(), TransportKind::Classic).await;
        next_event(&mut b_events, |e| {
            matches!(e, MeshEvent::ConnectionConfirmationRequired(_))
        })
        .await;

        b.manager.reject(&"A".to_string()).await.unwrap();
        assert!(!b.manager.is_connected(&"A".to_string()).await);
        assert!(b.manager.approve(&"A".to_string()).await.is_err());
    }

    #[tokio::test]
    async fn disconnect_notifies_both_sides() {
        let hub = MemoryHub::new();
        let a = node(&hub, "A").await;
        let b = node(&hub, "B").await;
        b.registry.set_auto_connect(&"A".to_string(), true).await;
        let mut a_events = a.events.subscribe();
        let mut b_events = b.events.subscribe();

        a.manager.connect(&"B".to_string(), TransportKind::Classic).await;
        next_event(&mut b_events, |e| matches!(e, MeshEvent::DeviceConnected(_))).await;

        a.manager.disconnect(&"B".to_string()).await;
        next_event(&mut a_events, |e| {
            matches!(e, MeshEvent::DeviceDisconnected(_))
        })
        .await;
        next_event(&mut b_events, |e| {
            matches!(e, MeshEvent::DeviceDisconnected(_))
        })
        .await;
        assert!(!a.manager.is_connected(&"B".to_string()).await);
        assert!(!b.manager.is_connected(&"A".to_string()).await);
    }

    #[tokio::test]
    async fn failed_dials_are_reported_not_returned() {
        let hub = MemoryHub::new();
        let a = node(&hub, "A").await;

        a.manager
            .connect(&"NOWHERE".to_string(), TransportKind::Classic)
            .await;
        assert!(!a.manager.is_connected(&"NOWHERE".to_string()).await);

        // The failed attempt must not leave a connecting guard behind.
        let b = node(&hub, "NOWHERE").await;
        b.registry.set_auto_connect(&"A".to_string(), true).await;
        a.manager
            .connect(&"NOWHERE".to_string(), TransportKind::Classic)
            .await;
        assert!(a.manager.is_connected(&"NOWHERE".to_string()).await);
    }
}
