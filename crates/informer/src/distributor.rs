//! Fan-out of reconciled changes to listeners.
//!
//! The registry mutex is the attach barrier: a new listener's snapshot, its
//! reset window and its registration all happen under the same lock the
//! broadcaster takes, so no change can fall between the snapshot and the
//! first broadcast the listener sees.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use kmirror_store::Indexer;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::listener::ListenerEntry;
use crate::{Notification, ResetMarker};

/// Receiver of the reconcile loop's output.
pub trait NotificationSink<K>: Send + Sync + 'static {
    /// `seq` is the store sequence of the write that produced `notification`.
    fn deliver(&self, seq: u64, notification: Notification<K>, is_sync: bool);

    /// A List's reset window opens, closes, or turned out empty.
    fn reset(&self, marker: ResetMarker);
}

pub struct Distributor<K> {
    listeners: Mutex<Vec<ListenerEntry<K>>>,
    next_id: AtomicU64,
}

impl<K> Default for Distributor<K> {
    fn default() -> Self { Self::new() }
}

impl<K> Distributor<K> {
    pub fn new() -> Self { Self { listeners: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) } }

    fn lock(&self) -> MutexGuard<'_, Vec<ListenerEntry<K>>> { self.listeners.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Register a listener. It first receives the current store contents as a
    /// reset window, then every broadcast newer than that snapshot.
    pub fn attach(&self, store: &Indexer<K>, tx: mpsc::UnboundedSender<Notification<K>>, resync: Option<Duration>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = self.lock();
        let (seq, items) = store.snapshot();
        let mut entry = ListenerEntry::new(id, tx, resync, Instant::now());
        entry.skip_through = seq;
        if items.is_empty() {
            entry.send(Notification::Reset(ResetMarker::Empty));
        } else {
            entry.send(Notification::Reset(ResetMarker::Begin));
            for obj in items.iter() {
                entry.send(Notification::Add(obj.clone()));
            }
            entry.send(Notification::Reset(ResetMarker::End));
        }
        reg.push(entry);
        metrics::gauge!("kmirror_listeners", reg.len() as f64);
        info!(listener = id, seq, items = items.len(), resync = ?resync, "listener attached");
        id
    }

    /// Remove a listener; false if it was not registered.
    pub fn detach(&self, id: u64) -> bool {
        let mut reg = self.lock();
        let before = reg.len();
        reg.retain(|l| l.id != id);
        metrics::gauge!("kmirror_listeners", reg.len() as f64);
        reg.len() != before
    }

    /// Drop every listener, closing their queues.
    pub fn clear(&self) {
        let mut reg = self.lock();
        reg.clear();
        metrics::gauge!("kmirror_listeners", 0.0);
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    /// Evaluate every listener's resync schedule at `now`. Listeners that are
    /// due become `syncing` and get their next deadline; returns whether any fired.
    pub fn should_resync(&self, now: Instant) -> bool {
        let mut reg = self.lock();
        let mut fired = 0usize;
        for l in reg.iter_mut() {
            if l.check_resync(now) {
                fired += 1;
            }
        }
        if fired > 0 {
            debug!(listeners = fired, "resync due");
        }
        fired > 0
    }

    /// Send a notification to every attached listener that has not already
    /// seen `seq` in its reset window. Sync notifications only go to
    /// listeners whose resync is in progress.
    pub fn distribute(&self, seq: u64, n: Notification<K>, is_sync: bool) {
        let reg = self.lock();
        for l in reg.iter() {
            if seq <= l.skip_through || (is_sync && !l.syncing) {
                continue;
            }
            l.send(n.clone());
        }
    }

    /// Send a List's window marker to every listener, whatever its snapshot
    /// sequence. `End` only reaches listeners that saw the matching `Begin`;
    /// one attached mid-window already got a complete window of its own.
    pub fn broadcast_reset(&self, marker: ResetMarker) {
        let mut reg = self.lock();
        for l in reg.iter_mut() {
            match marker {
                ResetMarker::Begin => l.in_window = true,
                ResetMarker::End if !l.in_window => continue,
                ResetMarker::End => l.in_window = false,
                ResetMarker::Empty => {}
            }
            l.send(Notification::Reset(marker));
        }
        debug!(?marker, listeners = reg.len(), "reset marker broadcast");
    }
}

impl<K> NotificationSink<K> for Distributor<K>
where
    K: Send + Sync + 'static,
{
    fn deliver(&self, seq: u64, notification: Notification<K>, is_sync: bool) { self.distribute(seq, notification, is_sync) }

    fn reset(&self, marker: ResetMarker) { self.broadcast_reset(marker) }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use k8s_openapi::api::core::v1::ConfigMap;
    use kmirror_core::ObjectKey;
    use kube::api::ObjectMeta;

    use super::*;

    fn cm(name: &str) -> Arc<ConfigMap> {
        Arc::new(ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some("ns".into()), ..Default::default() },
            ..Default::default()
        })
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Notification<ConfigMap>>) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(n) = rx.try_recv() {
            out.push(match n {
                Notification::Add(o) => format!("add:{}", o.metadata.name.as_deref().unwrap_or("")),
                Notification::Reset(m) => format!("{:?}", m),
                other => other.kind().to_string(),
            });
        }
        out
    }

    #[test]
    fn attach_replays_store_and_skips_older_broadcasts() {
        let store = Indexer::new();
        let applied = store.upsert(ObjectKey::new(Some("ns"), "a"), cm("a"));
        let d = Distributor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.attach(&store, tx, None);
        assert_eq!(drain(&mut rx), vec!["Begin", "add:a", "End"]);

        // A broadcast for the write already in the snapshot is suppressed.
        d.distribute(applied.seq, Notification::Add(cm("a")), false);
        assert!(drain(&mut rx).is_empty());

        let next = store.upsert(ObjectKey::new(Some("ns"), "b"), cm("b"));
        d.distribute(next.seq, Notification::Add(cm("b")), false);
        assert_eq!(drain(&mut rx), vec!["add:b"]);
    }

    #[test]
    fn empty_store_yields_single_marker() {
        let store: Indexer<ConfigMap> = Indexer::new();
        let d = Distributor::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        d.attach(&store, tx, None);
        assert_eq!(drain(&mut rx), vec!["Empty"]);
    }

    #[test]
    fn list_windows_reach_every_listener_once_opened() {
        let store = Indexer::new();
        let d = Distributor::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        d.attach(&store, tx1, None);
        assert_eq!(drain(&mut rx1), vec!["Empty"]);

        d.broadcast_reset(ResetMarker::Begin);
        let applied = store.upsert(ObjectKey::new(Some("ns"), "a"), cm("a"));
        d.distribute(applied.seq, Notification::Add(cm("a")), false);

        // Attached mid-window: its own snapshot window, then later changes only.
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        d.attach(&store, tx2, None);
        let next = store.upsert(ObjectKey::new(Some("ns"), "b"), cm("b"));
        d.distribute(next.seq, Notification::Add(cm("b")), false);
        d.broadcast_reset(ResetMarker::End);
        d.broadcast_reset(ResetMarker::Empty);

        assert_eq!(drain(&mut rx1), vec!["Begin", "add:a", "add:b", "End", "Empty"]);
        assert_eq!(drain(&mut rx2), vec!["Begin", "add:a", "End", "add:b", "Empty"]);
    }

    #[test]
    fn sync_notifications_reach_only_syncing_listeners() {
        let store: Indexer<ConfigMap> = Indexer::new();
        let d = Distributor::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        d.attach(&store, tx1, Some(Duration::from_secs(1)));
        d.attach(&store, tx2, None);
        drain(&mut rx1);
        drain(&mut rx2);

        assert!(!d.should_resync(Instant::now()));
        assert!(d.should_resync(Instant::now() + Duration::from_secs(2)));
        d.distribute(1, Notification::Update { old: cm("a"), new: cm("a") }, true);
        assert_eq!(drain(&mut rx1), vec!["update"]);
        assert!(drain(&mut rx2).is_empty());

        assert!(d.detach(1));
        assert!(!d.detach(1));
        assert_eq!(d.len(), 1);
    }
}
