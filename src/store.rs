//! Shared data layer the sync protocol replicates.
//!
//! Two tables cross the mesh: the app registry (which apps run on which
//! device) and the measurement log (timestamped records those apps produce).
//! The [`DataStore`] trait is the seam to whatever persistence backs a
//! deployment; [`MemoryStore`] is the in-process implementation used by the
//! coordinator tests.
//!
//! Change notification is edge-triggered: a write that leaves the table
//! byte-for-byte unchanged must not notify, otherwise two devices echoing
//! each other's sync payloads would loop forever.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, RwLock};

use crate::error::Result;
use crate::protocol::{AppId, DeviceAddress};

/// Which table a change notification refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeTopic {
    AppRegistry,
    Measurement,
}

/// One app installed on one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInfoRecord {
    pub device_address: DeviceAddress,
    pub app_id: AppId,
    pub app_name: String,
    pub version: u32,
}

/// One measurement produced by an app on a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementRecord {
    pub id: u64,
    pub device_address: DeviceAddress,
    pub app_id: AppId,
    pub class_name: String,
    pub data: String,
    pub recorded_at: i64,
}

/// Row selection for queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct RowFilter {
    pub device_address: Option<DeviceAddress>,
    pub app_id: Option<AppId>,
    pub newer_than: Option<i64>,
}

impl RowFilter {
    pub fn device(address: impl Into<DeviceAddress>) -> Self {
        Self {
            device_address: Some(address.into()),
            ..Self::default()
        }
    }

    pub fn newer_than(mut self, timestamp: i64) -> Self {
        self.newer_than = Some(timestamp);
        self
    }
}

/// Seam to the persistence backend.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn query_apps(&self, filter: &RowFilter) -> Result<Vec<AppInfoRecord>>;

    async fn query_measurements(&self, filter: &RowFilter) -> Result<Vec<MeasurementRecord>>;

    /// Upsert app rows. Returns whether anything actually changed.
    async fn write_apps(&self, rows: Vec<AppInfoRecord>) -> Result<bool>;

    /// Upsert measurement rows. Returns whether anything actually changed.
    async fn write_measurements(&self, rows: Vec<MeasurementRecord>) -> Result<bool>;

    /// Remove every row belonging to one device.
    async fn remove_device(&self, address: &DeviceAddress) -> Result<()>;

    /// Subscribe to change notifications. Only writes that changed data
    /// notify.
    fn subscribe(&self) -> broadcast::Receiver<ChangeTopic>;
}

const CHANGE_CAPACITY: usize = 64;

/// In-process store keyed the way the sync protocol addresses rows.
pub struct MemoryStore {
    apps: RwLock<HashMap<(DeviceAddress, AppId), AppInfoRecord>>,
    measurements: RwLock<HashMap<(DeviceAddress, u64), MeasurementRecord>>,
    changes: broadcast::Sender<ChangeTopic>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            apps: RwLock::new(HashMap::new()),
            measurements: RwLock::new(HashMap::new()),
            changes,
        }
    }

    fn notify(&self, topic: ChangeTopic) {
        // No subscribers is fine; the send error only means nobody listens.
        let _ = self.changes.send(topic);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn query_apps(&self, filter: &RowFilter) -> Result<Vec<AppInfoRecord>> {
        let apps = self.apps.read().await;
        let mut rows: Vec<_> = apps
            .values()
            .filter(|row| {
                filter
                    .device_address
                    .as_ref()
                    .map_or(true, |d| *d == row.device_address)
                    && filter.app_id.as_ref().map_or(true, |a| *a == row.app_id)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| {
            (&a.device_address, &a.app_id).cmp(&(&b.device_address, &b.app_id))
        });
        Ok(rows)
    }

    async fn query_measurements(&self, filter: &RowFilter) -> Result<Vec<MeasurementRecord>> {
        let measurements = self.measurements.read().await;
        let mut rows: Vec<_> = measurements
            .values()
            .filter(|row| {
                filter
                    .device_address
                    .as_ref()
                    .map_or(true, |d| *d == row.device_address)
                    && filter.app_id.as_ref().map_or(true, |a| *a == row.app_id)
                    && filter.newer_than.map_or(true, |t| row.recorded_at > t)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|row| (row.recorded_at, row.id));
        Ok(rows)
    }

    async fn write_apps(&self, rows: Vec<AppInfoRecord>) -> Result<bool> {
        let mut apps = self.apps.write().await;
        let mut changed = false;
        for row in rows {
            let key = (row.device_address.clone(), row.app_id.clone());
            if apps.get(&key) != Some(&row) {
                apps.insert(key, row);
                changed = true;
            }
        }
        drop(apps);

        if changed {
            self.notify(ChangeTopic::AppRegistry);
        }
        Ok(changed)
    }

    async fn write_measurements(&self, rows: Vec<MeasurementRecord>) -> Result<bool> {
        let mut measurements = self.measurements.write().await;
        let mut changed = false;
        for row in rows {
            let key = (row.device_address.clone(), row.id);
            if measurements.get(&key) != Some(&row) {
                measurements.insert(key, row);
                changed = true;
            }
        }
        drop(measurements);

        if changed {
            self.notify(ChangeTopic::Measurement);
        }
        Ok(changed)
    }

    async fn remove_device(&self, address: &DeviceAddress) -> Result<()> {
        let mut apps = self.apps.write().await;
        let before = apps.len();
        apps.retain(|(device, _), _| device != address);
        let apps_changed = apps.len() != before;
        drop(apps);

        let mut measurements = self.measurements.write().await;
        let before = measurements.len();
        measurements.retain(|(device, _), _| device != address);
        let measurements_changed = measurements.len() != before;
        drop(measurements);

        if apps_changed {
            self.notify(ChangeTopic::AppRegistry);
        }
        if measurements_changed {
            self.notify(ChangeTopic::Measurement);
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ChangeTopic> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(device: &str, app_id: &str) -> AppInfoRecord {
        AppInfoRecord {
            device_address: device.to_string(),
            app_id: app_id.to_string(),
            app_name: app_id.to_uppercase(),
            version: 1,
        }
    }

    fn measurement(device: &str, id: u64, recorded_at: i64) -> MeasurementRecord {
        MeasurementRecord {
            id,
            device_address: device.to_string(),
            app_id: "app.sensor".to_string(),
            class_name: "HeartRate".to_string(),
            data: format!("{{\"bpm\":{id}}}"),
            recorded_at,
        }
    }

    #[tokio::test]
    async fn writes_notify_only_when_data_changes() {
        let store = MemoryStore::new();
        let mut changes = store.subscribe();

        assert!(store.write_apps(vec![app("A", "app.one")]).await.unwrap());
        assert_eq!(changes.recv().await.unwrap(), ChangeTopic::AppRegistry);

        // Identical rewrite: no change, no notification.
        assert!(!store.write_apps(vec![app("A", "app.one")]).await.unwrap());
        assert!(changes.try_recv().is_err());
    }

    #[tokio::test]
    async fn measurement_queries_honor_the_checkpoint() {
        let store = MemoryStore::new();
        store
            .write_measurements(vec![
                measurement("A", 1, 100),
                measurement("A", 2, 200),
                measurement("B", 3, 300),
            ])
            .await
            .unwrap();

        let rows = store
            .query_measurements(&RowFilter::device("A").newer_than(100))
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, 2);
    }

    #[tokio::test]
    async fn removing_a_device_drops_both_tables() {
        let store = MemoryStore::new();
        store
            .write_apps(vec![app("A", "app.one"), app("B", "app.two")])
            .await
            .unwrap();
        store
            .write_measurements(vec![measurement("A", 1, 100), measurement("B", 2, 200)])
            .await
            .unwrap();

        store.remove_device(&"A".to_string()).await.unwrap();

        let apps = store.query_apps(&RowFilter::default()).await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].device_address, "B");
        let rows = store
            .query_measurements(&RowFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].device_address, "B");
    }
}
