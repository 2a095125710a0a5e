//! Observer registration and update dispatch.
//!
//! State changes are delivered two ways: registered callbacks (invoked from
//! a dedicated dispatcher task, never from the read loop) and a broadcast
//! stream for `Stream`-oriented consumers. Both see the same updates in the
//! same order; per-device ordering follows frame arrival because a single
//! dispatcher drains a single FIFO queue.

use std::pin::Pin;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures_core::Stream;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::connection::ConnectionState;
use crate::model::{DeviceId, Feature, Value};

const BROADCAST_CAPACITY: usize = 256;

// ── Update ───────────────────────────────────────────────────────────

/// One state-change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// A full snapshot was applied. Emitted once per snapshot regardless
    /// of how many datapoints it touched.
    Snapshot,
    /// One datapoint changed value.
    Change(ValueChange),
    /// The connection state machine moved.
    Connection(ConnectionState),
}

/// A single datapoint transition.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueChange {
    pub device_id: DeviceId,
    /// `None` when the device reported a uid this crate has no name for;
    /// the raw values still flow.
    pub feature: Option<Feature>,
    /// Wire datapoint uid.
    pub uid: u32,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

// ── Callback registry ────────────────────────────────────────────────

/// Handle returned by `add_callback`; pass to `remove_callback`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback = Box<dyn Fn(&Update) + Send + Sync + 'static>;

pub(crate) struct Observers {
    callbacks: RwLock<Vec<(u64, Callback)>>,
    next_id: AtomicU64,
    broadcast_tx: broadcast::Sender<Update>,
}

impl Observers {
    pub(crate) fn new() -> Self {
        let (broadcast_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            broadcast_tx,
        }
    }

    pub(crate) fn add(&self, callback: Callback) -> CallbackId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .expect("observer registry lock poisoned")
            .push((id, callback));
        CallbackId(id)
    }

    /// Returns `true` if the callback was registered.
    pub(crate) fn remove(&self, id: CallbackId) -> bool {
        let mut callbacks = self
            .callbacks
            .write()
            .expect("observer registry lock poisoned");
        let before = callbacks.len();
        callbacks.retain(|(cb_id, _)| *cb_id != id.0);
        callbacks.len() != before
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Update> {
        self.broadcast_tx.subscribe()
    }

    fn dispatch(&self, update: &Update) {
        // No receivers is fine; stream consumers come and go.
        let _ = self.broadcast_tx.send(update.clone());

        let callbacks = self
            .callbacks
            .read()
            .expect("observer registry lock poisoned");
        for (_, callback) in callbacks.iter() {
            callback(update);
        }
    }
}

/// Drain the update queue, fanning each update out to every observer.
///
/// Runs until the queue's senders are dropped. A slow callback stalls this
/// task, not the read loop — backpressure lands on the bounded queue.
pub(crate) async fn dispatcher_task(
    observers: std::sync::Arc<Observers>,
    mut updates: mpsc::Receiver<Update>,
) {
    while let Some(update) = updates.recv().await {
        observers.dispatch(&update);
    }
    tracing::debug!("update dispatcher exiting");
}

// ── UpdateStream ─────────────────────────────────────────────────────

/// `Stream` of [`Update`]s.
///
/// Backed by a broadcast channel; a consumer that falls more than the
/// channel capacity behind skips the overwritten updates and keeps going.
pub struct UpdateStream {
    inner: BroadcastStream<Update>,
}

impl UpdateStream {
    pub(crate) fn new(receiver: broadcast::Receiver<Update>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
        }
    }
}

impl Stream for UpdateStream {
    type Item = Update;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(update))) => return Poll::Ready(Some(update)),
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(missed)))) => {
                    tracing::warn!(missed, "update stream lagged, skipping");
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn callbacks_fire_in_registration_order() {
        let observers = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = Arc::clone(&seen);
            observers.add(Box::new(move |_| seen.lock().unwrap().push(tag)));
        }

        observers.dispatch(&Update::Snapshot);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn removed_callback_stops_firing() {
        let observers = Observers::new();
        let count = Arc::new(Mutex::new(0));

        let counter = Arc::clone(&count);
        let id = observers.add(Box::new(move |_| *counter.lock().unwrap() += 1));

        observers.dispatch(&Update::Snapshot);
        assert!(observers.remove(id));
        observers.dispatch(&Update::Snapshot);

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(!observers.remove(id));
    }

    #[tokio::test]
    async fn broadcast_subscribers_see_dispatched_updates() {
        let observers = Observers::new();
        let mut rx = observers.subscribe();

        observers.dispatch(&Update::Snapshot);

        assert_eq!(rx.recv().await.unwrap(), Update::Snapshot);
    }

    #[tokio::test]
    async fn dispatcher_drains_queue_in_order() {
        let observers = Arc::new(Observers::new());
        let (tx, rx) = mpsc::channel(8);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        observers.add(Box::new(move |u| sink.lock().unwrap().push(u.clone())));

        let task = tokio::spawn(dispatcher_task(Arc::clone(&observers), rx));

        tx.send(Update::Snapshot).await.unwrap();
        tx.send(Update::Connection(ConnectionState::Connected))
            .await
            .unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                Update::Snapshot,
                Update::Connection(ConnectionState::Connected)
            ]
        );
    }
}
