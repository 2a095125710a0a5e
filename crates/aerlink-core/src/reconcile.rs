//! State reconciler: the single writer behind the state store.
//!
//! Merges the two state sources — bulk snapshots from the account exchange
//! and incremental pushes from the socket — into the store, and emits
//! ordered notifications into the dispatcher queue. An async mutex
//! serializes the apply paths so the socket read loop and ad-hoc status
//! polls can't interleave mid-update.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;

use aerlink_api::{CatalogDevice, Event, StatusEntry};

use crate::connection::ConnectionState;
use crate::model::{Device, DeviceId, Feature, NULL_VALUE, decode_value};
use crate::observer::{Update, ValueChange};
use crate::store::StateStore;

/// A command in flight: sent, not yet confirmed by an echoed datapoint.
///
/// Used to tell a command confirmation apart from an unrelated push for
/// the same datapoint. Records expire quietly after a timeout; the service
/// does not always echo writes that change nothing.
#[derive(Debug, Clone)]
pub(crate) struct PendingCommand {
    pub device_id: String,
    pub uid: u32,
    pub value: i64,
    pub issued_at: Instant,
}

pub(crate) struct Reconciler {
    store: std::sync::Arc<StateStore>,
    updates_tx: mpsc::Sender<Update>,
    pending: Mutex<Vec<PendingCommand>>,
    pending_timeout: Duration,
    /// Single-writer gate over store mutation + notification emission.
    gate: tokio::sync::Mutex<()>,
}

impl Reconciler {
    pub(crate) fn new(
        store: std::sync::Arc<StateStore>,
        updates_tx: mpsc::Sender<Update>,
        pending_timeout: Duration,
    ) -> Self {
        Self {
            store,
            updates_tx,
            pending: Mutex::new(Vec::new()),
            pending_timeout,
            gate: tokio::sync::Mutex::new(()),
        }
    }

    // ── Bulk path ────────────────────────────────────────────────────

    /// Install a session's catalog and apply its full snapshot.
    ///
    /// One atomic store update, one `Snapshot` notification — never one
    /// per datapoint, so observers don't get a callback storm on every
    /// reconnect.
    pub(crate) async fn apply_session(
        &self,
        devices: Vec<CatalogDevice>,
        snapshot: Vec<StatusEntry>,
    ) {
        let _write = self.gate.lock().await;

        let devices: Vec<Device> = devices.into_iter().map(Device::from).collect();
        tracing::debug!(
            devices = devices.len(),
            datapoints = snapshot.len(),
            "applying session snapshot"
        );

        self.store.load_catalog(devices);
        self.store.merge_snapshot(&snapshot);
        self.store.mark_refreshed();

        self.emit(Update::Snapshot).await;
    }

    // ── Incremental path ─────────────────────────────────────────────

    /// Route one decoded socket frame.
    pub(crate) async fn apply_frame(&self, event: Event) {
        match event {
            Event::FeatureChanged {
                device_id,
                uid,
                value,
            } => self.apply_delta(&device_id, uid, value).await,
            Event::SignalStrength { device_id, rssi } => {
                // Signal strength updates every few seconds; store it but
                // don't wake observers for it.
                let _write = self.gate.lock().await;
                self.store
                    .set_raw(&device_id, Feature::SignalStrength.uid(), Some(rssi));
            }
            // Handshake frames are consumed by the connection task;
            // anything else was already logged by the codec.
            _ => {}
        }
    }

    /// Apply one datapoint change and notify observers once.
    ///
    /// Idempotent: re-applying a delta the store already holds changes
    /// nothing and emits nothing.
    pub(crate) async fn apply_delta(&self, device_id: &str, uid: u32, value: i64) {
        let _write = self.gate.lock().await;

        self.confirm_pending(device_id, uid, value);

        let new_raw = if value == NULL_VALUE { None } else { Some(value) };
        let old_raw = self.store.set_raw(device_id, uid, new_raw);

        if old_raw == new_raw {
            tracing::trace!(device_id, uid, value, "no-op delta suppressed");
            return;
        }

        if uid == Feature::SignalStrength.uid() {
            return;
        }

        let feature = Feature::from_uid(uid);
        let fan_config = self
            .store
            .raw_value(device_id, Feature::ConfigFanMap.uid());
        let decode = |raw: i64| {
            feature.map_or(crate::model::Value::Number(raw), |f| {
                decode_value(f, raw, fan_config)
            })
        };

        let change = ValueChange {
            device_id: DeviceId::from(device_id),
            feature,
            uid,
            old: old_raw.map(decode),
            new: new_raw.map(decode),
        };
        tracing::debug!(device_id, uid, old = ?change.old, new = ?change.new, "datapoint changed");
        self.emit(Update::Change(change)).await;
    }

    /// Deliver a connection-state transition to observers, in order with
    /// the surrounding data updates.
    pub(crate) async fn connection_changed(&self, state: ConnectionState) {
        let _write = self.gate.lock().await;
        self.emit(Update::Connection(state)).await;
    }

    // ── Pending commands ─────────────────────────────────────────────

    /// Record a sent command awaiting its echo.
    pub(crate) fn note_sent(&self, device_id: &str, uid: u32, value: i64) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let now = Instant::now();
        pending.retain(|p| now.duration_since(p.issued_at) < self.pending_timeout);
        pending.push(PendingCommand {
            device_id: device_id.to_owned(),
            uid,
            value,
            issued_at: now,
        });
    }

    /// Commands still awaiting confirmation.
    pub(crate) fn pending_len(&self) -> usize {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        let now = Instant::now();
        pending.retain(|p| now.duration_since(p.issued_at) < self.pending_timeout);
        pending.len()
    }

    fn confirm_pending(&self, device_id: &str, uid: u32, value: i64) {
        let mut pending = self.pending.lock().expect("pending lock poisoned");
        if let Some(pos) = pending
            .iter()
            .position(|p| p.device_id == device_id && p.uid == uid && p.value == value)
        {
            pending.remove(pos);
            tracing::trace!(device_id, uid, value, "command confirmed by echo");
        }
    }

    // ── Emission ─────────────────────────────────────────────────────

    async fn emit(&self, update: Update) {
        if self.updates_tx.send(update).await.is_err() {
            tracing::debug!("update queue closed, dropping notification");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Value;
    use std::sync::Arc;

    fn harness() -> (Arc<Reconciler>, mpsc::Receiver<Update>) {
        let store = Arc::new(StateStore::new());
        let (tx, rx) = mpsc::channel(64);
        let reconciler = Arc::new(Reconciler::new(store, tx, Duration::from_secs(30)));
        (reconciler, rx)
    }

    fn catalog_device(id: &str) -> CatalogDevice {
        CatalogDevice {
            id: id.to_owned(),
            name: format!("Device {id}"),
            model_id: None,
            widgets: vec![42],
        }
    }

    #[tokio::test]
    async fn snapshot_emits_exactly_one_notification() {
        let (reconciler, mut rx) = harness();

        let snapshot = vec![
            StatusEntry { device_id: "1".into(), uid: 1, value: 0 },
            StatusEntry { device_id: "1".into(), uid: 2, value: 4 },
            StatusEntry { device_id: "1".into(), uid: 9, value: 210 },
        ];
        reconciler.apply_session(vec![catalog_device("1")], snapshot).await;

        assert_eq!(rx.recv().await.unwrap(), Update::Snapshot);
        assert!(rx.try_recv().is_err(), "snapshot must notify once, not per field");
    }

    #[tokio::test]
    async fn delta_carries_old_and_new_values() {
        let (reconciler, mut rx) = harness();
        reconciler
            .apply_session(
                vec![catalog_device("1")],
                vec![StatusEntry { device_id: "1".into(), uid: 1, value: 0 }],
            )
            .await;
        let _ = rx.recv().await; // snapshot

        reconciler.apply_delta("1", 1, 1).await;

        let Update::Change(change) = rx.recv().await.unwrap() else {
            panic!("expected a change update");
        };
        assert_eq!(change.feature, Some(Feature::Power));
        assert_eq!(change.old, Some(Value::Keyword("off")));
        assert_eq!(change.new, Some(Value::Keyword("on")));
    }

    #[tokio::test]
    async fn repeated_delta_is_suppressed() {
        let (reconciler, mut rx) = harness();

        reconciler.apply_delta("1", 1, 1).await;
        reconciler.apply_delta("1", 1, 1).await;

        assert!(matches!(rx.recv().await.unwrap(), Update::Change(_)));
        assert!(rx.try_recv().is_err(), "identical delta must not re-notify");
    }

    #[tokio::test]
    async fn null_sentinel_clears_the_value() {
        let (reconciler, mut rx) = harness();

        reconciler.apply_delta("1", 9, 210).await;
        reconciler.apply_delta("1", 9, NULL_VALUE).await;

        let _ = rx.recv().await;
        let Update::Change(change) = rx.recv().await.unwrap() else {
            panic!("expected a change update");
        };
        assert_eq!(change.old, Some(Value::Celsius(21.0)));
        assert_eq!(change.new, None);
    }

    #[tokio::test]
    async fn signal_strength_is_stored_without_notifying() {
        let (reconciler, mut rx) = harness();

        reconciler
            .apply_frame(Event::SignalStrength { device_id: "1".into(), rssi: 204 })
            .await;

        assert!(rx.try_recv().is_err());
        // A later power change still notifies normally.
        reconciler.apply_delta("1", 1, 1).await;
        assert!(matches!(rx.recv().await.unwrap(), Update::Change(_)));
    }

    #[tokio::test]
    async fn echo_confirms_pending_command() {
        let (reconciler, mut rx) = harness();

        reconciler.note_sent("1", 1, 1);
        assert_eq!(reconciler.pending_len(), 1);

        reconciler.apply_delta("1", 1, 1).await;

        assert_eq!(reconciler.pending_len(), 0);
        // Confirmation still surfaces as a normal change.
        assert!(matches!(rx.recv().await.unwrap(), Update::Change(_)));
    }

    #[tokio::test]
    async fn unrelated_push_leaves_pending_in_place() {
        let (reconciler, _rx) = harness();

        reconciler.note_sent("1", 9, 220);
        // A push for the same datapoint with a different value is not the
        // confirmation we're waiting for.
        reconciler.apply_delta("1", 9, 210).await;

        assert_eq!(reconciler.pending_len(), 1);
    }

    #[tokio::test]
    async fn pending_commands_expire() {
        let store = Arc::new(StateStore::new());
        let (tx, _rx) = mpsc::channel(8);
        let reconciler = Reconciler::new(store, tx, Duration::from_millis(0));

        reconciler.note_sent("1", 1, 1);
        assert_eq!(reconciler.pending_len(), 0);
    }
}
