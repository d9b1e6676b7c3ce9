//! Per-key deduplicating delta queue.
//!
//! Every change flowing from the reflector to the reconcile loop passes
//! through here. A key has at most one pending chain; a popped key is not
//! handed out again until its consumer reports `done`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kmirror_core::{Delta, DeltaType, Deltas, Error, ObjectKey, Result};
use kube::Resource;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::Indexer;

/// Where a popped chain falls relative to the reset window of a full List.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    /// No List batch is being drained.
    Outside,
    /// First chain of a batch; the window starts before it.
    Opens,
    /// Popped while a batch is being drained.
    Within,
    /// Last chain of a batch; the window ends after it.
    Closes,
    /// The batch's only chain.
    Whole,
}

impl Window {
    pub fn opens(self) -> bool { matches!(self, Window::Opens | Window::Whole) }
    pub fn closes(self) -> bool { matches!(self, Window::Closes | Window::Whole) }
}

/// A chain taken off the queue. Hand it back through [`DeltaQueue::done`]
/// once it has been applied.
#[derive(Debug)]
pub struct Popped<K> {
    pub key: ObjectKey,
    pub deltas: Deltas<K>,
    pub window: Window,
    /// Generation of the full List this chain belongs to, if any.
    initial: Option<u64>,
}

/// What [`DeltaQueue::pop`] hands out.
#[derive(Debug)]
pub enum QueueItem<K> {
    Chain(Popped<K>),
    /// A full List that listed nothing and left nothing to delete.
    EmptyList,
}

struct QueueState<K> {
    items: FxHashMap<ObjectKey, Deltas<K>>,
    order: VecDeque<ObjectKey>,
    /// Popped keys awaiting `done`, with the newest object of their chain
    /// (`None` when that record was a deletion).
    processing: FxHashMap<ObjectKey, Option<Arc<K>>>,
    populated: bool,
    initial_keys: FxHashSet<ObjectKey>,
    initial_population_count: usize,
    generation: u64,
    window_open: bool,
    empty_list: bool,
    closed: bool,
}

impl<K> QueueState<K> {
    fn has_synced(&self) -> bool { self.populated && self.initial_population_count == 0 }

    fn enqueue(&mut self, delta: Delta<K>) {
        metrics::counter!("kmirror_queue_deltas_total", 1u64, "kind" => delta.kind.as_str());
        let key = delta.key.clone();
        match self.items.get_mut(&key) {
            Some(chain) => {
                chain.push(delta);
                if chain.is_empty() {
                    self.items.remove(&key);
                    self.order.retain(|k| k != &key);
                }
            }
            None => {
                let mut chain = Deltas::new();
                chain.push(delta);
                if !chain.is_empty() {
                    self.items.insert(key.clone(), chain);
                    self.order.push_back(key);
                }
            }
        }
    }

    /// A pending empty-List marker first, then the first queued key that is
    /// not currently being processed.
    fn take_ready(&mut self) -> Option<QueueItem<K>> {
        if std::mem::take(&mut self.empty_list) {
            return Some(QueueItem::EmptyList);
        }
        let idx = self.order.iter().position(|k| !self.processing.contains_key(k))?;
        let key = self.order.remove(idx)?;
        let deltas = self.items.remove(&key).unwrap_or_default();
        let initial = if self.initial_keys.remove(&key) { Some(self.generation) } else { None };
        let window = match (initial.is_some(), self.window_open) {
            (false, false) => Window::Outside,
            (false, true) => Window::Within,
            (true, open) => {
                let last = self.initial_keys.is_empty();
                self.window_open = !last;
                match (open, last) {
                    (false, true) => Window::Whole,
                    (false, false) => Window::Opens,
                    (true, true) => Window::Closes,
                    (true, false) => Window::Within,
                }
            }
        };
        let newest = deltas.newest().filter(|d| !d.is_deletion()).map(|d| Arc::clone(&d.object));
        self.processing.insert(key.clone(), newest);
        Some(QueueItem::Chain(Popped { key, deltas, window, initial }))
    }
}

pub struct DeltaQueue<K> {
    state: Mutex<QueueState<K>>,
    known: Arc<Indexer<K>>,
    notify: Notify,
    synced_tx: watch::Sender<bool>,
}

impl<K> DeltaQueue<K> {
    /// Queue whose deletion inference and resync read from `known`.
    pub fn new(known: Arc<Indexer<K>>) -> Self {
        let (synced_tx, _) = watch::channel(false);
        Self {
            state: Mutex::new(QueueState {
                items: FxHashMap::default(),
                order: VecDeque::new(),
                processing: FxHashMap::default(),
                populated: false,
                initial_keys: FxHashSet::default(),
                initial_population_count: 0,
                generation: 0,
                window_open: false,
                empty_list: false,
                closed: false,
            }),
            known,
            notify: Notify::new(),
            synced_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn publish(&self, st: &QueueState<K>) {
        let synced = st.has_synced();
        self.synced_tx.send_if_modified(|v| {
            let changed = *v != synced;
            *v = synced;
            changed
        });
        metrics::gauge!("kmirror_queue_depth", st.order.len() as f64);
        self.notify.notify_waiters();
    }

    fn push(&self, delta: Delta<K>) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(Error::ShutDown);
        }
        if delta.kind != DeltaType::Sync {
            st.populated = true;
        }
        st.enqueue(delta);
        self.publish(&st);
        Ok(())
    }

    /// Take the next ready item, waiting until one exists. Returns `None`
    /// once the queue is closed or `cancel` fires.
    pub async fn pop(&self, cancel: &CancellationToken) -> Option<QueueItem<K>> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut st = self.lock();
                if st.closed {
                    return None;
                }
                if let Some(p) = st.take_ready() {
                    metrics::gauge!("kmirror_queue_depth", st.order.len() as f64);
                    return Some(p);
                }
            }
            tokio::select! {
                _ = &mut notified => {}
                _ = cancel.cancelled() => return None,
            }
        }
    }

    /// Mark a popped chain as applied. Releases the key for the next pop and
    /// counts towards `has_synced` when it was part of a full List.
    pub fn done(&self, popped: &Popped<K>) {
        let mut st = self.lock();
        st.processing.remove(&popped.key);
        if popped.initial == Some(st.generation) {
            st.initial_population_count = st.initial_population_count.saturating_sub(1);
            if st.initial_population_count == 0 {
                debug!("initial population applied");
            }
        }
        self.publish(&st);
    }

    /// Enqueue a `Sync` record for every stored key with nothing pending and
    /// nothing in flight. An in-flight key would otherwise race its own
    /// newer state back into the store.
    pub fn resync(&self) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(Error::ShutDown);
        }
        let mut n = 0usize;
        for key in self.known.list_keys() {
            if st.items.contains_key(&key) || st.processing.contains_key(&key) {
                continue;
            }
            let Some(obj) = self.known.get(&key) else { continue };
            st.enqueue(Delta::new(key, DeltaType::Sync, obj));
            n += 1;
        }
        debug!(keys = n, "resync queued");
        self.publish(&st);
        Ok(())
    }

    /// Close the queue; waiting poppers wake up with `None`, later writes fail.
    pub fn close(&self) {
        let mut st = self.lock();
        if !st.closed {
            st.closed = true;
            info!(pending = st.order.len(), "delta queue closed");
        }
        self.notify.notify_waiters();
    }

    /// True once the latest full List has been popped and applied.
    pub fn has_synced(&self) -> bool { self.lock().has_synced() }

    pub fn synced(&self) -> watch::Receiver<bool> { self.synced_tx.subscribe() }

    /// Number of keys with a pending chain.
    pub fn len(&self) -> usize { self.lock().order.len() }
    pub fn is_empty(&self) -> bool { self.lock().order.is_empty() }

    pub fn list_keys(&self) -> Vec<ObjectKey> { self.lock().order.iter().cloned().collect() }

    /// Copy of the pending chain for `key`.
    pub fn get(&self, key: &ObjectKey) -> Option<Deltas<K>> { self.lock().items.get(key).cloned() }
}

impl<K: Resource> DeltaQueue<K> {
    fn push_object(&self, kind: DeltaType, obj: K) -> Result<()> {
        let key = ObjectKey::for_object(&obj)?;
        self.push(Delta::new(key, kind, Arc::new(obj)))
    }

    pub fn add(&self, obj: K) -> Result<()> { self.push_object(DeltaType::Added, obj) }
    pub fn update(&self, obj: K) -> Result<()> { self.push_object(DeltaType::Updated, obj) }
    pub fn delete(&self, obj: K) -> Result<()> { self.push_object(DeltaType::Deleted, obj) }

    /// Reconcile a full List against the keys the mirror currently knows.
    ///
    /// Each item becomes `Replaced`; every known key missing from `items`
    /// becomes a final-state-unknown deletion carrying the last known object.
    /// Known means stored, queued or in flight, judged by the newest record.
    /// The batch is handed out as one reset window; a batch landing while an
    /// earlier one is still draining extends that window. Resets `has_synced`
    /// until the batch has been applied.
    pub fn replace(&self, items: Vec<K>, resource_version: &str) -> Result<()> {
        let mut st = self.lock();
        if st.closed {
            return Err(Error::ShutDown);
        }
        let mut batch: FxHashSet<ObjectKey> = std::mem::take(&mut st.initial_keys);
        let mut listed: FxHashSet<ObjectKey> = FxHashSet::default();
        for obj in items {
            let key = match ObjectKey::for_object(&obj) {
                Ok(k) => k,
                Err(e) => {
                    warn!(error = %e, "replace: skipping listed object without identity");
                    continue;
                }
            };
            listed.insert(key.clone());
            batch.insert(key.clone());
            st.enqueue(Delta::new(key, DeltaType::Replaced, Arc::new(obj)));
        }

        let mut vanished: Vec<(ObjectKey, Arc<K>)> = Vec::new();
        for key in self.known.list_keys() {
            if listed.contains(&key) || st.items.contains_key(&key) || st.processing.contains_key(&key) {
                continue;
            }
            if let Some(obj) = self.known.get(&key) {
                vanished.push((key, obj));
            }
        }
        for (key, chain) in st.items.iter() {
            if listed.contains(key) {
                continue;
            }
            if let Some(newest) = chain.newest() {
                if !newest.is_deletion() {
                    vanished.push((key.clone(), Arc::clone(&newest.object)));
                }
            }
        }
        for (key, newest) in st.processing.iter() {
            if listed.contains(key) || st.items.contains_key(key) {
                continue;
            }
            if let Some(obj) = newest {
                vanished.push((key.clone(), Arc::clone(obj)));
            }
        }
        let deletions = vanished.len();
        for (key, last_known) in vanished {
            batch.insert(key.clone());
            st.enqueue(Delta::deleted_final_state_unknown(key, last_known));
        }

        st.populated = true;
        st.generation += 1;
        st.initial_population_count = batch.len();
        st.empty_list = batch.is_empty();
        st.initial_keys = batch;
        info!(listed = listed.len(), deletions, rv = %resource_version, "delta queue replaced");
        self.publish(&st);
        Ok(())
    }
}
