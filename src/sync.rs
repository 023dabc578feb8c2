//! Replication triggers for the shared data set.
//!
//! The sync coordinator never owns data; it watches the local store and turns
//! change notifications into envelopes, with the direction decided by the
//! local role at dispatch time. A host answers any app-registry change by
//! broadcasting the full registry snapshot; a peer pushes only its own slice
//! point-to-point to the current host. Measurements flow strictly upward:
//! peers push deltas past a per-host checkpoint, hosts push nothing.
//!
//! Inbound sync envelopes are applied to the store verbatim. Echo loops
//! terminate because the store only notifies on writes that changed data.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::protocol::{
    next_code, DeviceAddress, Envelope, COORDINATOR_APP_ID, MESSAGE_TYPE_SYNC_APP_INFO,
    MESSAGE_TYPE_SYNC_MEASUREMENT,
};
use crate::registry::{DeviceRegistry, DeviceRole};
use crate::router::MessageRouter;
use crate::store::{AppInfoRecord, ChangeTopic, DataStore, MeasurementRecord, RowFilter};

/// True for envelope kinds the sync coordinator consumes.
pub fn is_sync_kind(kind: i32) -> bool {
    kind == MESSAGE_TYPE_SYNC_APP_INFO || kind == MESSAGE_TYPE_SYNC_MEASUREMENT
}

pub struct SyncCoordinator {
    registry: Arc<DeviceRegistry>,
    store: Arc<dyn DataStore>,
    router: Arc<MessageRouter>,
    /// Latest measurement timestamp each host is known to hold from us.
    checkpoints: RwLock<HashMap<DeviceAddress, i64>>,
    task: Mutex<Option<JoinHandle<()>>>,
    me: Weak<Self>,
}

impl SyncCoordinator {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        store: Arc<dyn DataStore>,
        router: Arc<MessageRouter>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            store,
            router,
            checkpoints: RwLock::new(HashMap::new()),
            task: Mutex::new(None),
            me: me.clone(),
        })
    }

    /// Start watching the local store for changes.
    pub fn start(&self) {
        let mut changes = self.store.subscribe();
        let me = self.me.clone();
        let task = tokio::spawn(async move {
            loop {
                let Some(sync) = me.upgrade() else { break };
                match changes.recv().await {
                    Ok(ChangeTopic::AppRegistry) => sync.on_app_registry_changed().await,
                    Ok(ChangeTopic::Measurement) => sync.on_measurement_changed().await,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        // Every dispatch reads fresh store state, so skipped
                        // notifications collapse into the next one.
                        debug!("sync loop lagged {n} notifications");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        *self.task.lock().unwrap() = Some(task);
    }

    pub fn stop(&self) {
        if let Some(task) = self.task.lock().unwrap().take() {
            task.abort();
        }
    }

    /// Write one received sync envelope into the local store.
    pub async fn apply_remote(&self, envelope: &Envelope) -> Result<()> {
        match envelope.kind {
            MESSAGE_TYPE_SYNC_APP_INFO => {
                let rows: Vec<AppInfoRecord> = envelope.payload_as()?;
                self.store.write_apps(rows).await?;
            }
            MESSAGE_TYPE_SYNC_MEASUREMENT => {
                let rows: Vec<MeasurementRecord> = envelope.payload_as()?;
                self.store.write_measurements(rows).await?;
            }
            other => debug!("ignoring non-sync envelope kind {other}"),
        }
        Ok(())
    }

    async fn on_app_registry_changed(&self) {
        match self.registry.local_role().await {
            DeviceRole::Host => {
                let rows = match self.store.query_apps(&RowFilter::default()).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!("app registry snapshot failed: {e}");
                        return;
                    }
                };
                self.push_apps(rows, None).await;
            }
            DeviceRole::Peer => {
                let Some(host) = self.registry.current_host().await else {
                    debug!("app registry changed but no host is known");
                    return;
                };
                let filter = RowFilter::device(self.registry.local_address().clone());
                let rows = match self.store.query_apps(&filter).await {
                    Ok(rows) => rows,
                    Err(e) => {
                        warn!("local app slice query failed: {e}");
                        return;
                    }
                };
                if rows.is_empty() {
                    return;
                }
                self.push_apps(rows, Some(host.address)).await;
            }
            DeviceRole::Unknown => debug!("app registry changed before a role was assigned"),
        }
    }

    async fn on_measurement_changed(&self) {
        // Hosts hold the authoritative measurement set; only peers push.
        if self.registry.local_role().await != DeviceRole::Peer {
            return;
        }
        let Some(host) = self.registry.current_host().await else {
            debug!("measurements changed but no host is known");
            return;
        };

        let checkpoint = self
            .checkpoints
            .read()
            .await
            .get(&host.address)
            .copied()
            .unwrap_or(0);
        let filter =
            RowFilter::device(self.registry.local_address().clone()).newer_than(checkpoint);
        let rows = match self.store.query_measurements(&filter).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("measurement delta query failed: {e}");
                return;
            }
        };
        if rows.is_empty() {
            return;
        }

        let newest = rows.iter().map(|r| r.recorded_at).max().unwrap_or(checkpoint);
        if self
            .push(MESSAGE_TYPE_SYNC_MEASUREMENT, &rows, Some(host.address.clone()))
            .await
        {
            self.checkpoints.write().await.insert(host.address, newest);
        }
    }

    async fn push_apps(&self, rows: Vec<AppInfoRecord>, dest: Option<DeviceAddress>) {
        self.push(MESSAGE_TYPE_SYNC_APP_INFO, &rows, dest).await;
    }

    async fn push<T: serde::Serialize>(
        &self,
        kind: i32,
        rows: &T,
        dest: Option<DeviceAddress>,
    ) -> bool {
        // No destination app: sync envelopes reach every bound session on
        // the receiving device as well as its store.
        let mut builder = Envelope::builder()
            .source_device(self.registry.local_address().clone())
            .source_app(COORDINATOR_APP_ID)
            .kind(kind)
            .code(next_code());
        if let Some(dest) = dest {
            builder = builder.dest_device(dest);
        }

        let envelope = builder
            .payload_json(rows)
            .and_then(|b| b.build());
        let envelope = match envelope {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("building sync envelope failed: {e}");
                return false;
            }
        };
        match self.router.send(&envelope).await {
            Ok(()) => true,
            Err(e) => {
                warn!("sync push failed: {e}");
                false
            }
        }
    }
}
