//! The mesh coordinator: one explicitly constructed context object.
//!
//! [`MeshCoordinator::start`] wires the registry, connection manager, router,
//! session keeper, discovery and sync coordinators together over a caller
//! supplied radio and store, then runs the inbound dispatch task that feeds
//! received envelopes to sync and to the bound app sessions. Everything the
//! coordinator spawns is torn down deterministically by [`shutdown`].
//!
//! [`shutdown`]: MeshCoordinator::shutdown

use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::task::JoinHandle;

use crate::config::MeshConfig;
use crate::connection::ConnectionManager;
use crate::discovery::DiscoveryCoordinator;
use crate::error::Result;
use crate::events::{EventBus, MeshEvent};
use crate::protocol::DeviceAddress;
use crate::registry::{DeviceRegistry, DeviceRole};
use crate::router::MessageRouter;
use crate::session::{ClientSessionKeeper, SessionHandle};
use crate::store::DataStore;
use crate::sync::{is_sync_kind, SyncCoordinator};
use crate::transport::Radio;

pub struct MeshCoordinator {
    events: EventBus,
    registry: Arc<DeviceRegistry>,
    connections: Arc<ConnectionManager>,
    router: Arc<MessageRouter>,
    keeper: Arc<ClientSessionKeeper>,
    discovery: Arc<DiscoveryCoordinator>,
    sync: Arc<SyncCoordinator>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
}

impl MeshCoordinator {
    /// Validate the config, wire every component and start the background
    /// tasks.
    pub async fn start(
        config: MeshConfig,
        radio: Arc<dyn Radio>,
        store: Arc<dyn DataStore>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let events = EventBus::new(config.event_capacity);
        let registry = Arc::new(DeviceRegistry::new(
            config.local_address.clone(),
            config.local_name.clone(),
            config.local_capability,
            events.clone(),
        ));

        let (connections, mut inbound) = ConnectionManager::new(
            Arc::clone(&registry),
            Arc::clone(&radio),
            events.clone(),
            &config,
        );
        connections.start().await;

        let router = Arc::new(MessageRouter::new(
            Arc::clone(&registry),
            Arc::clone(&connections),
        ));
        let keeper = Arc::new(ClientSessionKeeper::new(
            Arc::clone(&registry),
            config.inbound_queue,
        ));
        let discovery = DiscoveryCoordinator::new(
            Arc::clone(&registry),
            radio,
            Arc::clone(&connections),
            events.clone(),
            &config,
        );
        let sync = SyncCoordinator::new(Arc::clone(&registry), store, Arc::clone(&router));
        sync.start();

        let coordinator = Arc::new(Self {
            events,
            registry,
            connections,
            router,
            keeper,
            discovery,
            sync,
            dispatch_task: Mutex::new(None),
        });

        let dispatcher = Arc::clone(&coordinator);
        let task = tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                let Some(envelope) = dispatcher.router.on_receive(&frame) else {
                    continue;
                };
                if is_sync_kind(envelope.kind) {
                    if let Err(e) = dispatcher.sync.apply_remote(&envelope).await {
                        warn!("applying sync envelope from {} failed: {e}", frame.from);
                    }
                }
                // Sync envelopes update the store and still reach the bound
                // sessions like any other inbound envelope.
                dispatcher.keeper.deliver(&envelope).await;
            }
            debug!("inbound dispatch loop ended");
        });
        *coordinator.dispatch_task.lock().unwrap() = Some(task);

        info!("mesh coordinator up as {}", coordinator.local_address());
        Ok(coordinator)
    }

    /// Bind an app and hand it the full local session API.
    pub async fn bind(&self, app_id: &str, app_name: &str) -> SessionHandle {
        let inbox = self.keeper.bind(app_id, app_name).await;
        SessionHandle::new(
            app_id.to_string(),
            Arc::clone(&self.keeper),
            Arc::clone(&self.registry),
            Arc::clone(&self.discovery),
            Arc::clone(&self.connections),
            Arc::clone(&self.router),
            self.events.clone(),
            inbox,
        )
    }

    pub fn local_address(&self) -> &DeviceAddress {
        self.registry.local_address()
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Subscribe to coordinator state-change events.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Grant or advance a device's role. Roles only move forward; use
    /// [`DeviceRegistry::replace_identity`] for an explicit identity change.
    pub async fn assign_role(&self, address: &DeviceAddress, role: DeviceRole) {
        self.registry.set_role(address, role).await;
    }

    /// Flip the global auto-connect policy.
    pub fn set_auto_connect(&self, enabled: bool) {
        self.discovery.set_auto_connect(enabled);
        self.events.publish(MeshEvent::ConfigurationChanged);
    }

    /// Accept a parked unsolicited connection.
    pub async fn approve_connection(&self, address: &DeviceAddress) -> Result<()> {
        self.connections.approve(address).await
    }

    /// Drop a parked unsolicited connection.
    pub async fn reject_connection(&self, address: &DeviceAddress) -> Result<()> {
        self.connections.reject(address).await
    }

    /// Stop discovery, close every connection and end the background tasks.
    pub async fn shutdown(&self) {
        info!("mesh coordinator shutting down");
        self.discovery.stop_discovery().await;
        self.sync.stop();
        if let Some(task) = self.dispatch_task.lock().unwrap().take() {
            task.abort();
        }
        self.connections.shutdown().await;
    }
}
