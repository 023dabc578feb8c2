//! Canonical in-memory table of every known device.
//!
//! The registry exclusively owns [`Device`] records: one per stable radio
//! address, created on first discovery and never destroyed for the process
//! lifetime, only updated. Every mutation emits the matching state event on
//! the coordinator bus, so discovery and connection management never
//! broadcast device state themselves.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::events::{EventBus, MeshEvent};
use crate::protocol::DeviceAddress;
use crate::transport::TransportKind;

/// Role of a device inside the mesh.
///
/// The derived ordering encodes the only legal progression:
/// `Unknown → Peer → Host`. A role never regresses except through
/// [`DeviceRegistry::replace_identity`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub enum DeviceRole {
    #[default]
    Unknown,
    Peer,
    Host,
}

/// Which radio transports a device speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportCapability {
    Classic,
    LowEnergy,
    Dual,
}

impl TransportCapability {
    pub fn supports(&self, kind: TransportKind) -> bool {
        match (self, kind) {
            (TransportCapability::Dual, _) => true,
            (TransportCapability::Classic, TransportKind::Classic) => true,
            (TransportCapability::LowEnergy, TransportKind::LowEnergy) => true,
            _ => false,
        }
    }
}

impl From<TransportKind> for TransportCapability {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Classic => TransportCapability::Classic,
            TransportKind::LowEnergy => TransportCapability::LowEnergy,
        }
    }
}

/// One remote (or the local) radio-addressable participant in the mesh.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable radio address; uniquely identifies the device across both
    /// transports.
    pub address: DeviceAddress,
    pub name: String,
    pub capability: TransportCapability,
    pub discovered_at: Option<DateTime<Utc>>,
    pub bonded: bool,
    pub connected: bool,
    pub role: DeviceRole,
    pub auto_connect: bool,
}

impl Device {
    /// Bare record for an address nothing else is known about yet.
    pub fn placeholder(address: impl Into<DeviceAddress>) -> Self {
        Self {
            address: address.into(),
            name: String::new(),
            capability: TransportCapability::Classic,
            discovered_at: None,
            bonded: false,
            connected: false,
            role: DeviceRole::Unknown,
            auto_connect: false,
        }
    }
}

/// Canonical device table, keyed by radio address.
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceAddress, Device>>,
    local_address: DeviceAddress,
    events: EventBus,
}

impl DeviceRegistry {
    /// Create a registry seeded with the local device record.
    pub fn new(
        local_address: DeviceAddress,
        local_name: String,
        capability: TransportCapability,
        events: EventBus,
    ) -> Self {
        let mut devices = HashMap::new();
        let local = Device {
            name: local_name,
            capability,
            ..Device::placeholder(local_address.clone())
        };
        devices.insert(local_address.clone(), local);

        Self {
            devices: RwLock::new(devices),
            local_address,
            events,
        }
    }

    pub fn local_address(&self) -> &DeviceAddress {
        &self.local_address
    }

    /// Role the local device currently holds.
    pub async fn local_role(&self) -> DeviceRole {
        self.devices
            .read()
            .await
            .get(&self.local_address)
            .map(|d| d.role)
            .unwrap_or_default()
    }

    /// The device currently designated as host, if any. Prefers a connected
    /// host when several records claim the role.
    pub async fn current_host(&self) -> Option<Device> {
        let devices = self.devices.read().await;
        let mut host: Option<&Device> = None;
        for device in devices.values() {
            if device.role == DeviceRole::Host {
                match host {
                    Some(existing) if existing.connected || !device.connected => {}
                    _ => host = Some(device),
                }
            }
        }
        host.cloned()
    }

    /// Merge `incoming` into the record with the same address, creating the
    /// record if absent. Last-writer-wins per field, except `role`, which only
    /// ever moves forward.
    pub async fn upsert(&self, incoming: Device) -> Device {
        let (device, newly_visible) = {
            let mut devices = self.devices.write().await;
            match devices.get_mut(&incoming.address) {
                Some(existing) => {
                    let was_discovered = existing.discovered_at.is_some();
                    if !incoming.name.is_empty() {
                        existing.name = incoming.name;
                    }
                    existing.capability = incoming.capability;
                    existing.discovered_at = incoming.discovered_at.or(existing.discovered_at);
                    existing.bonded = incoming.bonded;
                    existing.connected = incoming.connected;
                    existing.auto_connect = incoming.auto_connect;
                    existing.role = existing.role.max(incoming.role);
                    (
                        existing.clone(),
                        !was_discovered && existing.discovered_at.is_some(),
                    )
                }
                None => {
                    let address = incoming.address.clone();
                    devices.insert(address, incoming.clone());
                    (incoming, true)
                }
            }
        };

        if newly_visible {
            self.events.publish(MeshEvent::DeviceDiscovered(device.clone()));
        }
        device
    }

    /// Record a device seen by a scan: refreshes name, capability and the
    /// discovery timestamp, leaves connection state alone, and broadcasts a
    /// discovery event for every sighting.
    pub async fn mark_discovered(
        &self,
        address: &str,
        name: &str,
        capability: TransportCapability,
    ) -> Device {
        let device = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .entry(address.to_string())
                .or_insert_with(|| Device::placeholder(address.to_string()));
            if !name.is_empty() {
                entry.name = name.to_string();
            }
            entry.capability = capability;
            entry.discovered_at = Some(Utc::now());
            entry.clone()
        };

        self.events.publish(MeshEvent::DeviceDiscovered(device.clone()));
        device
    }

    pub async fn get(&self, address: &str) -> Option<Device> {
        self.devices.read().await.get(address).cloned()
    }

    /// Record for `address`, upserting a placeholder when unknown.
    pub async fn get_or_placeholder(&self, address: &str) -> Device {
        self.devices
            .write()
            .await
            .entry(address.to_string())
            .or_insert_with(|| Device::placeholder(address.to_string()))
            .clone()
    }

    /// Devices seen by a completed scan cycle, local device excluded.
    pub async fn list_discovered(&self) -> Vec<Device> {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| d.discovered_at.is_some() && d.address != self.local_address)
            .cloned()
            .collect()
    }

    /// Devices with an open connection.
    pub async fn list_connected(&self) -> Vec<Device> {
        self.devices
            .read()
            .await
            .values()
            .filter(|d| d.connected && d.address != self.local_address)
            .cloned()
            .collect()
    }

    /// Flip the connected flag, emitting DEVICE_CONNECTED or
    /// DEVICE_DISCONNECTED when the flag actually changes. Unknown addresses
    /// are upserted as placeholders.
    pub async fn set_connected(&self, address: &str, connected: bool) -> Device {
        let (device, changed) = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .entry(address.to_string())
                .or_insert_with(|| Device::placeholder(address.to_string()));
            let changed = entry.connected != connected;
            entry.connected = connected;
            (entry.clone(), changed)
        };

        if changed {
            let event = if connected {
                MeshEvent::DeviceConnected(device.clone())
            } else {
                MeshEvent::DeviceDisconnected(device.clone())
            };
            self.events.publish(event);
        }
        device
    }

    /// Record a bonding change, emitting CONFIGURATION_CHANGED when the flag
    /// actually flips.
    pub async fn set_bonded(&self, address: &str, bonded: bool) -> Device {
        let (device, changed) = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .entry(address.to_string())
                .or_insert_with(|| Device::placeholder(address.to_string()));
            let changed = entry.bonded != bonded;
            entry.bonded = bonded;
            (entry.clone(), changed)
        };
        if changed {
            self.events.publish(MeshEvent::ConfigurationChanged);
        }
        device
    }

    /// Flag a device for auto-connect, emitting CONFIGURATION_CHANGED when
    /// the flag actually flips.
    pub async fn set_auto_connect(&self, address: &str, enabled: bool) -> Device {
        let (device, changed) = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .entry(address.to_string())
                .or_insert_with(|| Device::placeholder(address.to_string()));
            let changed = entry.auto_connect != enabled;
            entry.auto_connect = enabled;
            (entry.clone(), changed)
        };
        if changed {
            self.events.publish(MeshEvent::ConfigurationChanged);
        }
        device
    }

    /// Advance the role of a device. Backward transitions are ignored; use
    /// [`DeviceRegistry::replace_identity`] for an explicit identity change.
    pub async fn set_role(&self, address: &str, role: DeviceRole) -> Device {
        let mut devices = self.devices.write().await;
        let entry = devices
            .entry(address.to_string())
            .or_insert_with(|| Device::placeholder(address.to_string()));
        if role < entry.role {
            debug!(
                "ignoring role regression {:?} -> {:?} for {}",
                entry.role, role, address
            );
        }
        entry.role = entry.role.max(role);
        entry.clone()
    }

    /// Explicit identity change: the one path that may regress a role.
    /// Emits DEVICE_IDENTITY_CHANGED.
    pub async fn replace_identity(&self, address: &str, role: DeviceRole) -> Device {
        let device = {
            let mut devices = self.devices.write().await;
            let entry = devices
                .entry(address.to_string())
                .or_insert_with(|| Device::placeholder(address.to_string()));
            entry.role = role;
            entry.clone()
        };

        self.events.publish(MeshEvent::DeviceIdentityChanged(device.clone()));
        device
    }
}
