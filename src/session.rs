//! Client sessions: the seam between local applications and the mesh.
//!
//! Each locally installed app binds one [`ClientSession`] keyed by its
//! package id. Binds are idempotent; a repeat bind joins the existing
//! session. Inbound envelopes reach a session through its broadcast inbox
//! and, when registered, a synchronous callback.
//!
//! [`SessionHandle`] is the bind result the coordinator hands out: the full
//! local API one app uses to drive discovery, connections and messaging.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use tokio::sync::{broadcast, RwLock};

use crate::connection::ConnectionManager;
use crate::discovery::DiscoveryCoordinator;
use crate::error::Result;
use crate::events::{EventBus, MeshEvent};
use crate::protocol::{AppId, DeviceAddress, Envelope, EnvelopeBuilder};
use crate::registry::{Device, DeviceRegistry};
use crate::router::MessageRouter;
use crate::transport::{TransportKind, TransportPreference};

/// Synchronous delivery hook an app may register alongside its inbox.
pub type SessionCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

struct ClientSession {
    app_name: String,
    inbox: broadcast::Sender<Envelope>,
    callback: Option<SessionCallback>,
}

/// Owns every bound [`ClientSession`], keyed by app package id.
pub struct ClientSessionKeeper {
    registry: Arc<DeviceRegistry>,
    sessions: RwLock<HashMap<AppId, ClientSession>>,
    inbox_capacity: usize,
}

impl ClientSessionKeeper {
    pub fn new(registry: Arc<DeviceRegistry>, inbox_capacity: usize) -> Self {
        Self {
            registry,
            sessions: RwLock::new(HashMap::new()),
            inbox_capacity,
        }
    }

    /// Bind an app, creating its session on first use. Idempotent: a repeat
    /// bind subscribes to the existing session's inbox.
    pub async fn bind(&self, app_id: &str, app_name: &str) -> broadcast::Receiver<Envelope> {
        let mut sessions = self.sessions.write().await;
        match sessions.get(app_id) {
            Some(session) => session.inbox.subscribe(),
            None => {
                let (inbox, rx) = broadcast::channel(self.inbox_capacity);
                sessions.insert(
                    app_id.to_string(),
                    ClientSession {
                        app_name: app_name.to_string(),
                        inbox,
                        callback: None,
                    },
                );
                rx
            }
        }
    }

    /// Attach a delivery callback, creating the session when the app never
    /// bound explicitly.
    pub async fn register_callback(&self, app_id: &str, callback: SessionCallback) {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(app_id) {
            Some(session) => session.callback = Some(callback),
            None => {
                let (inbox, _) = broadcast::channel(self.inbox_capacity);
                sessions.insert(
                    app_id.to_string(),
                    ClientSession {
                        app_name: app_id.to_string(),
                        inbox,
                        callback: Some(callback),
                    },
                );
            }
        }
    }

    /// Remove an app's session. Unbinding an unknown app is a no-op.
    pub async fn unbind(&self, app_id: &str) {
        self.sessions.write().await.remove(app_id);
    }

    pub async fn bound_apps(&self) -> Vec<(AppId, String)> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, s)| (id.clone(), s.app_name.clone()))
            .collect()
    }

    /// Deliver one envelope to the matching session, or to every session when
    /// no destination app is set. Unknown destinations are dropped.
    pub async fn deliver(&self, envelope: &Envelope) {
        let sessions = self.sessions.read().await;
        match &envelope.dest_app_id {
            Some(app_id) => match sessions.get(app_id) {
                Some(session) => Self::hand_over(session, envelope),
                None => debug!("no session for {app_id}; envelope dropped"),
            },
            None => {
                for session in sessions.values() {
                    Self::hand_over(session, envelope);
                }
            }
        }
    }

    fn hand_over(session: &ClientSession, envelope: &Envelope) {
        // A lagging or absent inbox reader is the app's problem, not ours.
        let _ = session.inbox.send(envelope.clone());
        if let Some(callback) = &session.callback {
            callback(envelope);
        }
    }

    /// Snapshot of devices a completed scan has seen.
    pub async fn discovered_devices(&self) -> Vec<Device> {
        self.registry.list_discovered().await
    }

    /// Snapshot of devices with an open connection.
    pub async fn connected_devices(&self) -> Vec<Device> {
        self.registry.list_connected().await
    }
}

/// The local session API handed to an app by
/// [`MeshCoordinator::bind`](crate::coordinator::MeshCoordinator::bind).
pub struct SessionHandle {
    app_id: AppId,
    keeper: Arc<ClientSessionKeeper>,
    registry: Arc<DeviceRegistry>,
    discovery: Arc<DiscoveryCoordinator>,
    connections: Arc<ConnectionManager>,
    router: Arc<MessageRouter>,
    events: EventBus,
    inbox: broadcast::Receiver<Envelope>,
}

impl SessionHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        app_id: AppId,
        keeper: Arc<ClientSessionKeeper>,
        registry: Arc<DeviceRegistry>,
        discovery: Arc<DiscoveryCoordinator>,
        connections: Arc<ConnectionManager>,
        router: Arc<MessageRouter>,
        events: EventBus,
        inbox: broadcast::Receiver<Envelope>,
    ) -> Self {
        Self {
            app_id,
            keeper,
            registry,
            discovery,
            connections,
            router,
            events,
            inbox,
        }
    }

    pub fn app_id(&self) -> &AppId {
        &self.app_id
    }

    pub async fn start_discovery(&self, preference: TransportPreference) {
        self.discovery.start_discovery(preference).await;
    }

    pub async fn stop_discovery(&self) {
        self.discovery.stop_discovery().await;
    }

    pub async fn connect(&self, address: &DeviceAddress, kind: TransportKind) {
        self.connections.connect(address, kind).await;
    }

    pub async fn disconnect(&self, address: &DeviceAddress) {
        self.connections.disconnect(address).await;
    }

    /// Builder pre-addressed with this session's source identity.
    pub fn compose(&self) -> EnvelopeBuilder {
        Envelope::builder()
            .source_device(self.registry.local_address().clone())
            .source_app(self.app_id.clone())
    }

    /// Route one envelope: to the local sessions when it addresses this
    /// device, otherwise out over the radio.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        if envelope.dest_device_address.as_ref() == Some(self.registry.local_address()) {
            self.keeper.deliver(&envelope).await;
            return Ok(());
        }
        self.router.send(&envelope).await
    }

    /// Subscribe to coordinator state-change events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    pub async fn register_callback(&self, callback: SessionCallback) {
        self.keeper.register_callback(&self.app_id, callback).await;
    }

    pub async fn list_discovered(&self) -> Vec<Device> {
        self.keeper.discovered_devices().await
    }

    pub async fn list_connected(&self) -> Vec<Device> {
        self.keeper.connected_devices().await
    }

    /// Next envelope addressed to this app.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.inbox.recv().await {
                Ok(envelope) => return Some(envelope),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("session {} dropped {n} envelopes", self.app_id);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::protocol::MESSAGE_TYPE_DATA;
    use crate::registry::TransportCapability;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn keeper() -> ClientSessionKeeper {
        let events = EventBus::new(16);
        let registry = Arc::new(DeviceRegistry::new(
            "AA:BB:CC:DD:EE:00".to_string(),
            "local".to_string(),
            TransportCapability::Dual,
            events,
        ));
        ClientSessionKeeper::new(registry, 32)
    }

    fn envelope(dest_app: Option<&str>) -> Envelope {
        let mut builder = Envelope::builder()
            .source_device("AA:BB:CC:DD:EE:01")
            .source_app("com.example.remote")
            .kind(MESSAGE_TYPE_DATA)
            .payload("{}");
        if let Some(app) = dest_app {
            builder = builder.dest_app(app);
        }
        builder.build().unwrap()
    }

    #[tokio::test]
    async fn repeat_binds_share_one_session() {
        let keeper = keeper();
        let mut first = keeper.bind("com.example.alpha", "Alpha").await;
        let mut second = keeper.bind("com.example.alpha", "Alpha").await;
        assert_eq!(keeper.bound_apps().await.len(), 1);

        keeper.deliver(&envelope(Some("com.example.alpha"))).await;
        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }

    #[tokio::test]
    async fn delivery_matches_the_destination_app() {
        let keeper = keeper();
        let mut alpha = keeper.bind("com.example.alpha", "Alpha").await;
        let mut beta = keeper.bind("com.example.beta", "Beta").await;

        keeper.deliver(&envelope(Some("com.example.beta"))).await;
        assert!(alpha.try_recv().is_err());
        assert!(beta.recv().await.is_ok());

        keeper.deliver(&envelope(None)).await;
        assert!(alpha.recv().await.is_ok());
        assert!(beta.recv().await.is_ok());
    }

    #[tokio::test]
    async fn callbacks_fire_and_create_missing_sessions() {
        let keeper = keeper();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&hits);
        keeper
            .register_callback(
                "com.example.alpha",
                Arc::new(move |_| {
                    seen.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;
        assert_eq!(keeper.bound_apps().await.len(), 1);

        keeper.deliver(&envelope(Some("com.example.alpha"))).await;
        keeper.deliver(&envelope(None)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unbind_drops_delivery() {
        let keeper = keeper();
        keeper.bind("com.example.alpha", "Alpha").await;
        keeper.unbind("com.example.alpha").await;
        assert!(keeper.bound_apps().await.is_empty());

        // Dropped silently, no panic.
        keeper.deliver(&envelope(Some("com.example.alpha"))).await;
    }
}
