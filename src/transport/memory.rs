//! In-process radio for testing and development.
//!
//! A [`MemoryHub`] stands in for the shared radio medium: every
//! [`MemoryRadio`] that joins it can scan for the others, resolve their
//! capabilities, and open classic or low-energy links to them. Classic links
//! run over in-memory duplex streams, low-energy links over paired frame
//! channels, so the full connection lifecycle is exercised without hardware.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use crate::error::{Error, Result};
use crate::protocol::DeviceAddress;
use crate::registry::TransportCapability;

use super::classic::ClassicLink;
use super::le::LeLink;
use super::{FoundDevice, IncomingLink, LinkSession, Radio, TransportKind};

/// Pause between consecutive scan sightings, approximating radio pacing.
const SCAN_DWELL: Duration = Duration::from_millis(10);

const INCOMING_DEPTH: usize = 16;
const CLASSIC_PIPE_CAPACITY: usize = 64 * 1024;

struct HubEntry {
    name: String,
    capability: TransportCapability,
    incoming_tx: mpsc::Sender<IncomingLink>,
}

/// The shared medium connecting every joined radio.
pub struct MemoryHub {
    entries: Mutex<HashMap<DeviceAddress, HubEntry>>,
    me: Weak<Self>,
}

impl MemoryHub {
    pub fn new() -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            entries: Mutex::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Join the hub as one device and get its radio.
    pub fn join(
        &self,
        address: impl Into<DeviceAddress>,
        name: impl Into<String>,
        capability: TransportCapability,
    ) -> MemoryRadio {
        let address = address.into();
        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_DEPTH);
        self.entries.lock().unwrap().insert(
            address.clone(),
            HubEntry {
                name: name.into(),
                capability,
                incoming_tx,
            },
        );

        MemoryRadio {
            hub: self.me.clone(),
            address,
            scan_cancel: Mutex::new(None),
            incoming_rx: Mutex::new(Some(incoming_rx)),
        }
    }

    fn sightings(&self, exclude: &str, kind: TransportKind) -> Vec<FoundDevice> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(address, entry)| {
                address.as_str() != exclude && entry.capability.supports(kind)
            })
            .map(|(address, entry)| FoundDevice {
                address: address.clone(),
                name: entry.name.clone(),
                kind,
            })
            .collect()
    }

    fn capability_of(&self, address: &str) -> Option<TransportCapability> {
        self.entries
            .lock()
            .unwrap()
            .get(address)
            .map(|e| e.capability)
    }

    fn incoming_tx_of(&self, address: &str) -> Option<mpsc::Sender<IncomingLink>> {
        self.entries
            .lock()
            .unwrap()
            .get(address)
            .map(|e| e.incoming_tx.clone())
    }
}

/// One device's radio on a [`MemoryHub`].
pub struct MemoryRadio {
    hub: Weak<MemoryHub>,
    address: DeviceAddress,
    scan_cancel: Mutex<Option<watch::Sender<bool>>>,
    incoming_rx: Mutex<Option<mpsc::Receiver<IncomingLink>>>,
}

impl MemoryRadio {
    pub fn address(&self) -> &DeviceAddress {
        &self.address
    }

    fn hub(&self) -> Result<Arc<MemoryHub>> {
        self.hub
            .upgrade()
            .ok_or_else(|| Error::Transport("radio medium is gone".into()))
    }

    async fn deliver_far_end(&self, target: &str, link: IncomingLink) -> Result<()> {
        let tx = self
            .hub()?
            .incoming_tx_of(target)
            .ok_or_else(|| Error::Transport(format!("no device at {target}")))?;
        tx.send(link)
            .await
            .map_err(|_| Error::Transport(format!("{target} is not accepting connections")))
    }
}

#[async_trait]
impl Radio for MemoryRadio {
    async fn start_scan(&self, kind: TransportKind) -> Result<mpsc::Receiver<FoundDevice>> {
        let sightings = self.hub()?.sightings(&self.address, kind);
        let (found_tx, found_rx) = mpsc::channel(INCOMING_DEPTH);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        *self.scan_cancel.lock().unwrap() = Some(cancel_tx);

        tokio::spawn(async move {
            for found in sightings {
                tokio::select! {
                    _ = tokio::time::sleep(SCAN_DWELL) => {
                        if found_tx.send(found).await.is_err() {
                            break;
                        }
                    }
                    _ = cancel_rx.changed() => break,
                }
            }
            // found_tx drops here; the closed channel marks scan completion
        });

        Ok(found_rx)
    }

    async fn cancel_scan(&self) {
        if let Some(cancel) = self.scan_cancel.lock().unwrap().take() {
            let _ = cancel.send(true);
        }
    }

    async fn resolve_capability(&self, address: &DeviceAddress) -> Result<TransportCapability> {
        self.hub()?
            .capability_of(address)
            .ok_or_else(|| Error::Transport(format!("no device at {address}")))
    }

    async fn open_classic(&self, address: &DeviceAddress) -> Result<Box<dyn LinkSession>> {
        let capability = self.resolve_capability(address).await?;
        if !capability.supports(TransportKind::Classic) {
            return Err(Error::Transport(format!(
                "{address} does not speak the classic transport"
            )));
        }

        let (near, far) = tokio::io::duplex(CLASSIC_PIPE_CAPACITY);
        let far_link = IncomingLink {
            address: self.address.clone(),
            kind: TransportKind::Classic,
            session: Box::new(ClassicLink::new(self.address.clone(), far)),
        };
        self.deliver_far_end(address, far_link).await?;
        Ok(Box::new(ClassicLink::new(address.clone(), near)))
    }

    async fn open_low_energy(&self, address: &DeviceAddress) -> Result<Box<dyn LinkSession>> {
        let capability = self.resolve_capability(address).await?;
        if !capability.supports(TransportKind::LowEnergy) {
            return Err(Error::Transport(format!(
                "{address} does not speak the low-energy transport"
            )));
        }

        let (near, far) = LeLink::pair(address.clone(), self.address.clone());
        let far_link = IncomingLink {
            address: self.address.clone(),
            kind: TransportKind::LowEnergy,
            session: Box::new(far),
        };
        self.deliver_far_end(address, far_link).await?;
        Ok(Box::new(near))
    }

    async fn take_incoming(&self) -> Option<mpsc::Receiver<IncomingLink>> {
        self.incoming_rx.lock().unwrap().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn scan_sights_other_radios_on_the_matching_transport() {
        let hub = MemoryHub::new();
        let radio = hub.join("A", "alpha", TransportCapability::Dual);
        hub.join("B", "beta", TransportCapability::Classic);
        hub.join("C", "gamma", TransportCapability::LowEnergy);

        let mut rx = radio.start_scan(TransportKind::Classic).await.unwrap();
        let mut seen = Vec::new();
        while let Some(found) = rx.recv().await {
            seen.push(found.address);
        }
        assert_eq!(seen, vec!["B".to_string()]);
    }

    #[tokio::test]
    async fn cancelling_closes_the_sighting_stream() {
        let hub = MemoryHub::new();
        let radio = hub.join("A", "alpha", TransportCapability::Dual);
        for i in 0..16 {
            hub.join(format!("D{i}"), "dev", TransportCapability::Dual);
        }

        let mut rx = radio.start_scan(TransportKind::Classic).await.unwrap();
        let first = rx.recv().await;
        assert!(first.is_some());
        radio.cancel_scan().await;

        let remaining = async {
            let mut n = 0;
            while rx.recv().await.is_some() {
                n += 1;
            }
            n
        };
        let drained = tokio::time::timeout(Duration::from_secs(1), remaining)
            .await
            .expect("scan did not wind down after cancel");
        assert!(drained < 15);
    }

    #[tokio::test]
    async fn classic_dial_reaches_the_far_incoming_queue() {
        let hub = MemoryHub::new();
        let a = hub.join("A", "alpha", TransportCapability::Dual);
        let b = hub.join("B", "beta", TransportCapability::Classic);

        let mut b_incoming = b.take_incoming().await.unwrap();
        let near = a.open_classic(&"B".to_string()).await.unwrap();
        let far = b_incoming.recv().await.unwrap();
        assert_eq!(far.address, "A");
        assert_eq!(far.kind, TransportKind::Classic);

        let (mut near_tx, _near_rx) = near.split();
        let (_far_tx, mut far_rx) = far.session.split();
        near_tx.send(Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(far_rx.recv().await.unwrap().unwrap(), "hello");
    }

    #[tokio::test]
    async fn capability_gates_the_link_type() {
        let hub = MemoryHub::new();
        let a = hub.join("A", "alpha", TransportCapability::Dual);
        let _c = hub.join("C", "gamma", TransportCapability::LowEnergy);

        assert!(a.open_classic(&"C".to_string()).await.is_err());
        assert!(a.open_low_energy(&"C".to_string()).await.is_ok());
    }
}
