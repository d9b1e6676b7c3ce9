//! Queue → store → listeners.

use std::sync::Arc;
use std::time::Duration;

use kmirror_core::DeltaType;
use kmirror_store::{DeltaQueue, Indexer, Popped, QueueItem};
use kube::Resource;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{Notification, NotificationSink, ResetMarker};

/// Decides whether a timer tick should turn into a queue resync.
pub type ResyncGate = Arc<dyn Fn() -> bool + Send + Sync>;

pub struct ReconcileLoop<K> {
    queue: Arc<DeltaQueue<K>>,
    store: Arc<Indexer<K>>,
    sink: Arc<dyn NotificationSink<K>>,
}

/// Running reconcile and resync tasks.
pub struct ReconcileHandle {
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ReconcileHandle {
    /// Cancel both loops and wait for them to finish.
    pub async fn stop(self) {
        self.cancel.cancel();
        for t in self.tasks {
            let _ = t.await;
        }
    }
}

impl<K> ReconcileLoop<K>
where
    K: Resource + Send + Sync + 'static,
{
    pub fn new(queue: Arc<DeltaQueue<K>>, store: Arc<Indexer<K>>, sink: Arc<dyn NotificationSink<K>>) -> Self {
        Self { queue, store, sink }
    }

    /// Apply one popped chain to the store and forward each record. A chain
    /// that opens or closes a List's reset window is bracketed by the markers.
    pub fn process(&self, popped: &Popped<K>) {
        if popped.window.opens() {
            self.sink.reset(ResetMarker::Begin);
        }
        for d in popped.deltas.iter() {
            if d.kind == DeltaType::Deleted {
                let applied = self.store.remove(&d.key);
                if applied.old.is_none() {
                    debug!(key = %d.key, "deletion of an absent key; nothing to notify");
                    continue;
                }
                let n = Notification::Delete { obj: d.object.clone(), final_state_unknown: d.final_state_unknown };
                self.sink.deliver(applied.seq, n, false);
                continue;
            }
            let applied = self.store.upsert(d.key.clone(), d.object.clone());
            let n = match applied.old {
                Some(old) => Notification::Update { old, new: d.object.clone() },
                None => Notification::Add(d.object.clone()),
            };
            self.sink.deliver(applied.seq, n, d.kind == DeltaType::Sync);
        }
        if popped.window.closes() {
            self.sink.reset(ResetMarker::End);
        }
        debug!(key = %popped.key, records = popped.deltas.len(), "chain reconciled");
    }

    /// Handle one item taken off the queue and acknowledge it.
    pub fn handle(&self, item: QueueItem<K>) {
        match item {
            QueueItem::EmptyList => self.sink.reset(ResetMarker::Empty),
            QueueItem::Chain(popped) => {
                self.process(&popped);
                self.queue.done(&popped);
            }
        }
    }

    /// Pop and handle items until cancelled or the queue is closed.
    pub async fn run(&self, cancel: CancellationToken) {
        while let Some(item) = self.queue.pop(&cancel).await {
            self.handle(item);
        }
        info!("reconcile loop stopped");
    }

    /// Every `period`, ask `gate` (if any) and request a queue resync when it agrees.
    pub async fn run_resync(&self, period: Duration, gate: Option<ResyncGate>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            if !gate.as_ref().map_or(true, |g| g()) {
                continue;
            }
            if self.queue.resync().is_err() {
                break;
            }
        }
        debug!("resync timer stopped");
    }

    /// Spawn the reconcile loop and, when `resync` is set, the resync timer.
    pub fn spawn(self: Arc<Self>, resync: Option<(Duration, Option<ResyncGate>)>, cancel: CancellationToken) -> ReconcileHandle {
        let mut tasks = Vec::with_capacity(2);
        tasks.push(tokio::spawn({
            let this = self.clone();
            let cancel = cancel.clone();
            async move { this.run(cancel).await }
        }));
        if let Some((period, gate)) = resync {
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move { self.run_resync(period, gate, cancel).await }));
        }
        ReconcileHandle { cancel, tasks }
    }
}
