//! Discovery cycles across both radio transports.
//!
//! A cycle scans the classic transport first and, when the preference asks
//! for it, chains into a low-energy scan after the classic one completes.
//! Scans never run in parallel; the radio gets a short settle gap between
//! them. Every cycle is bracketed by DISCOVERY_STARTED / DISCOVERY_FINISHED,
//! including cycles that die to a radio error.
//!
//! A sighted device only enters the registry once its capability resolves;
//! cancellation mid-lookup leaves the registry untouched for that device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::connection::ConnectionManager;
use crate::events::{EventBus, MeshEvent};
use crate::registry::DeviceRegistry;
use crate::transport::{FoundDevice, Radio, TransportKind, TransportPreference};

pub struct DiscoveryCoordinator {
    registry: Arc<DeviceRegistry>,
    radio: Arc<dyn Radio>,
    connections: Arc<ConnectionManager>,
    events: EventBus,
    /// Global gate on dialing devices flagged for auto-connect.
    auto_connect: AtomicBool,
    scanning: AtomicBool,
    stop_requested: AtomicBool,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    scan_gap: Duration,
    me: Weak<Self>,
}

impl DiscoveryCoordinator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        radio: Arc<dyn Radio>,
        connections: Arc<ConnectionManager>,
        events: EventBus,
        config: &MeshConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            radio,
            connections,
            events,
            auto_connect: AtomicBool::new(config.auto_connect),
            scanning: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            scan_task: Mutex::new(None),
            scan_gap: config.scan_gap,
            me: me.clone(),
        })
    }

    /// Begin one discovery cycle. A cycle already in progress makes this a
    /// no-op.
    pub async fn start_discovery(&self, preference: TransportPreference) {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("discovery already running");
            return;
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.events.publish(MeshEvent::DiscoveryStarted);

        let me = self.me.clone();
        let task = tokio::spawn(async move {
            let Some(coordinator) = me.upgrade() else { return };
            let mut scanned_classic = false;
            if preference.includes(TransportKind::Classic) {
                coordinator.run_scan(TransportKind::Classic).await;
                scanned_classic = true;
            }

            if preference.includes(TransportKind::LowEnergy) {
                if scanned_classic {
                    tokio::time::sleep(coordinator.scan_gap).await;
                }
                // Re-check after the gap: a stop landing between the scans
                // would otherwise miss the not-yet-registered cancel handle.
                if !coordinator.stop_requested.load(Ordering::SeqCst) {
                    coordinator.run_scan(TransportKind::LowEnergy).await;
                }
            }

            coordinator.scanning.store(false, Ordering::SeqCst);
            coordinator.events.publish(MeshEvent::DiscoveryFinished);
        });
        *self.scan_task.lock().unwrap() = Some(task);
    }

    /// Cancel the active cycle. Idempotent; a no-op when idle. The cycle
    /// still closes with DISCOVERY_FINISHED once the radio winds down.
    pub async fn stop_discovery(&self) {
        if !self.scanning.load(Ordering::SeqCst) {
            return;
        }
        info!("stopping discovery");
        self.stop_requested.store(true, Ordering::SeqCst);
        self.radio.cancel_scan().await;
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    pub fn set_auto_connect(&self, enabled: bool) {
        self.auto_connect.store(enabled, Ordering::SeqCst);
    }

    async fn run_scan(&self, kind: TransportKind) {
        let mut sightings = match self.radio.start_scan(kind).await {
            Ok(rx) => rx,
            // Radio trouble degrades to an empty scan, never an error.
            Err(e) => {
                warn!("{kind:?} scan failed to start: {e}");
                return;
            }
        };

        while let Some(found) = sightings.recv().await {
            // The stop flag covers stops that raced the radio-side cancel
            // registration.
            if self.stop_requested.load(Ordering::SeqCst) {
                break;
            }
            self.handle_sighting(found).await;
        }
    }

    async fn handle_sighting(&self, found: FoundDevice) {
        // Resolve before touching the registry; a device whose lookup fails
        // or is cancelled mid-flight was never discovered.
        let capability = match self.radio.resolve_capability(&found.address).await {
            Ok(capability) => capability,
            Err(e) => {
                warn!("capability lookup for {} failed: {e}", found.address);
                return;
            }
        };

        let device = self
            .registry
            .mark_discovered(&found.address, &found.name, capability)
            .await;

        if self.auto_connect.load(Ordering::SeqCst) && device.auto_connect && !device.connected {
            let kind = if capability.supports(TransportKind::Classic) {
                TransportKind::Classic
            } else {
                TransportKind::LowEnergy
            };
            info!("auto-connecting to {}", device.address);
            self.connections.connect(&device.address, kind).await;
        }
    }
}
