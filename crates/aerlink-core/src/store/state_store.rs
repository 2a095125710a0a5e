// ── Central state store ──
//
// Thread-safe storage for the device catalog and the raw datapoint table.
// Readers are wait-free: the catalog roster and the value table are both
// swapped atomically, so a reader always sees a consistent snapshot.
// All mutation funnels through the reconciler (single-writer discipline);
// the store itself does not serialize writers.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;

use crate::model::Device;

type ValueTable = HashMap<String, HashMap<u32, i64>>;

pub(crate) struct StateStore {
    /// Catalog lookup by device id.
    devices: DashMap<String, Arc<Device>>,
    /// Catalog listing in account order, swapped per session.
    roster: ArcSwap<Vec<Arc<Device>>>,
    /// Raw datapoint values: device id -> uid -> value. Null-sentinel
    /// datapoints are absent rather than stored.
    values: ArcSwap<ValueTable>,
    /// When the last full snapshot was applied.
    last_full_refresh: watch::Sender<Option<DateTime<Utc>>>,
}

impl StateStore {
    pub(crate) fn new() -> Self {
        let (last_full_refresh, _) = watch::channel(None);
        Self {
            devices: DashMap::new(),
            roster: ArcSwap::from_pointee(Vec::new()),
            values: ArcSwap::from_pointee(HashMap::new()),
            last_full_refresh,
        }
    }

    // ── Catalog ──────────────────────────────────────────────────────

    /// Install a session's catalog. Replaces the roster; devices that
    /// vanished from the account are forgotten, but their datapoint values
    /// are left in place (stale data beats no data).
    pub(crate) fn load_catalog(&self, devices: Vec<Device>) {
        let roster: Vec<Arc<Device>> = devices.into_iter().map(Arc::new).collect();
        self.devices.clear();
        for device in &roster {
            self.devices
                .insert(device.id.as_str().to_owned(), Arc::clone(device));
        }
        self.roster.store(Arc::new(roster));
    }

    pub(crate) fn device(&self, id: &str) -> Option<Arc<Device>> {
        self.devices.get(id).map(|r| Arc::clone(r.value()))
    }

    pub(crate) fn devices_snapshot(&self) -> Arc<Vec<Arc<Device>>> {
        self.roster.load_full()
    }

    pub(crate) fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// First device in account order; the keepalive query targets it.
    pub(crate) fn first_device_id(&self) -> Option<String> {
        self.roster
            .load()
            .first()
            .map(|d| d.id.as_str().to_owned())
    }

    // ── Values ───────────────────────────────────────────────────────

    pub(crate) fn raw_value(&self, device_id: &str, uid: u32) -> Option<i64> {
        self.values
            .load()
            .get(device_id)
            .and_then(|datapoints| datapoints.get(&uid))
            .copied()
    }

    /// Set one datapoint, returning the previous value. `None` clears it
    /// (the service's null sentinel).
    pub(crate) fn set_raw(&self, device_id: &str, uid: u32, value: Option<i64>) -> Option<i64> {
        let mut table: ValueTable = (**self.values.load()).clone();
        let datapoints = table.entry(device_id.to_owned()).or_default();
        let old = match value {
            Some(v) => datapoints.insert(uid, v),
            None => datapoints.remove(&uid),
        };
        self.values.store(Arc::new(table));
        old
    }

    /// Merge a bulk snapshot in one atomic swap. Entries overwrite their
    /// datapoints; datapoints the snapshot does not mention keep their
    /// last-known value.
    pub(crate) fn merge_snapshot(&self, entries: &[aerlink_api::StatusEntry]) {
        let mut table: ValueTable = (**self.values.load()).clone();
        for entry in entries {
            let datapoints = table.entry(entry.device_id.clone()).or_default();
            if entry.value == crate::model::NULL_VALUE {
                datapoints.remove(&entry.uid);
            } else {
                datapoints.insert(entry.uid, entry.value);
            }
        }
        self.values.store(Arc::new(table));
    }

    // ── Metadata ─────────────────────────────────────────────────────

    pub(crate) fn mark_refreshed(&self) {
        let _ = self.last_full_refresh.send(Some(Utc::now()));
    }

    pub(crate) fn last_full_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_full_refresh.borrow()
    }

    /// How long ago the last full snapshot landed, or `None` if never.
    pub(crate) fn data_age(&self) -> Option<chrono::Duration> {
        self.last_full_refresh().map(|t| Utc::now() - t)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{DeviceId, NULL_VALUE};
    use aerlink_api::StatusEntry;

    fn device(id: &str, name: &str) -> Device {
        Device {
            id: DeviceId::from(id),
            name: name.to_owned(),
            model_id: None,
            widgets: Vec::new(),
        }
    }

    #[test]
    fn catalog_replaces_roster_but_keeps_values() {
        let store = StateStore::new();
        store.load_catalog(vec![device("1", "old")]);
        store.set_raw("1", 9, Some(210));

        store.load_catalog(vec![device("2", "new")]);

        assert!(store.device("1").is_none());
        assert!(store.device("2").is_some());
        assert_eq!(store.raw_value("1", 9), Some(210));
    }

    #[test]
    fn set_raw_returns_previous_value() {
        let store = StateStore::new();
        assert_eq!(store.set_raw("1", 1, Some(0)), None);
        assert_eq!(store.set_raw("1", 1, Some(1)), Some(0));
        assert_eq!(store.set_raw("1", 1, None), Some(1));
        assert_eq!(store.raw_value("1", 1), None);
    }

    #[test]
    fn merge_snapshot_overwrites_without_clearing() {
        let store = StateStore::new();
        store.set_raw("1", 1, Some(0));
        store.set_raw("1", 9, Some(210));

        store.merge_snapshot(&[StatusEntry {
            device_id: "1".to_owned(),
            uid: 1,
            value: 1,
        }]);

        assert_eq!(store.raw_value("1", 1), Some(1));
        // Untouched datapoint survives the snapshot.
        assert_eq!(store.raw_value("1", 9), Some(210));
    }

    #[test]
    fn merge_snapshot_drops_null_sentinel() {
        let store = StateStore::new();
        store.set_raw("1", 10, Some(240));

        store.merge_snapshot(&[StatusEntry {
            device_id: "1".to_owned(),
            uid: 10,
            value: NULL_VALUE,
        }]);

        assert_eq!(store.raw_value("1", 10), None);
    }

    #[test]
    fn first_device_follows_account_order() {
        let store = StateStore::new();
        assert_eq!(store.first_device_id(), None);
        store.load_catalog(vec![device("7", "a"), device("3", "b")]);
        assert_eq!(store.first_device_id().as_deref(), Some("7"));
    }

    #[test]
    fn refresh_metadata() {
        let store = StateStore::new();
        assert!(store.last_full_refresh().is_none());
        assert!(store.data_age().is_none());
        store.mark_refreshed();
        assert!(store.last_full_refresh().is_some());
        assert!(store.data_age().unwrap() >= chrono::Duration::zero());
    }
}
