//! Shared informer: one list/watch pipeline, many subscribers.
//!
//! The pipeline is connected lazily on the first subscription and torn down
//! after the last one leaves. The store outlives connections; a reconnect
//! starts from an unconditioned List and reconciles against it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use kmirror_core::{Error, ListOptions, MirrorConfig, Result};
use kmirror_kubehub::{Reflector, Source};
use kmirror_store::{DeltaQueue, IndexFunc, Indexer, Lister};
use kube::Resource;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::listener::{clamp_resync, spawn_delivery};
use crate::reconcile::{ReconcileHandle, ReconcileLoop, ResyncGate};
use crate::{Distributor, NotificationSink, ResourceEventHandler};

struct Live<K, S> {
    queue: Arc<DeltaQueue<K>>,
    reflector: Arc<Reflector<K, S>>,
}

struct Running {
    cancel: CancellationToken,
    reflector_task: JoinHandle<()>,
    reconcile: ReconcileHandle,
}

struct Delivery {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Connection {
    listeners: HashMap<u64, Delivery>,
    running: Option<Running>,
    stopped: bool,
}

struct Shared<K, S> {
    source: Arc<S>,
    options: ListOptions,
    config: MirrorConfig,
    store: Arc<Indexer<K>>,
    distributor: Arc<Distributor<K>>,
    root: CancellationToken,
    conn: Mutex<Connection>,
    live: ArcSwapOption<Live<K, S>>,
}

/// Handle to a shared informer; clones share the same pipeline.
pub struct SharedInformer<K, S> {
    shared: Arc<Shared<K, S>>,
}

impl<K, S> Clone for SharedInformer<K, S> {
    fn clone(&self) -> Self { Self { shared: Arc::clone(&self.shared) } }
}

/// An attached listener. Call [`Subscription::unsubscribe`] to detach and
/// wait for its delivery task; dropping it detaches in the background.
pub struct Subscription<K, S>
where
    K: Resource + Clone + Send + Sync + 'static,
    S: Source<K>,
{
    id: u64,
    shared: Option<Arc<Shared<K, S>>>,
}

impl<K, S> Shared<K, S>
where
    K: Resource + Clone + Send + Sync + 'static,
    S: Source<K>,
{
    fn connect(&self) -> Running {
        let cancel = self.root.child_token();
        let queue = Arc::new(DeltaQueue::new(self.store.clone()));
        let reflector =
            Arc::new(Reflector::new(self.source.clone(), queue.clone(), self.options.clone(), self.config.clone()));
        let sink: Arc<dyn NotificationSink<K>> = self.distributor.clone();
        let reconcile = Arc::new(ReconcileLoop::new(queue.clone(), self.store.clone(), sink));

        let distributor = self.distributor.clone();
        let gate: ResyncGate = Arc::new(move || distributor.should_resync(Instant::now()));
        let reconcile = reconcile.spawn(Some((self.config.resync_check, Some(gate))), cancel.child_token());
        let reflector_task = tokio::spawn({
            let r = reflector.clone();
            let c = cancel.clone();
            async move { r.run(c).await }
        });
        self.live.store(Some(Arc::new(Live { queue, reflector })));
        info!(ns = ?self.options.namespace, labels = ?self.options.label_selector, "informer connected");
        Running { cancel, reflector_task, reconcile }
    }

    async fn disconnect(&self, conn: &mut Connection) {
        let Some(running) = conn.running.take() else { return };
        running.cancel.cancel();
        if let Some(live) = self.live.swap(None) {
            live.queue.close();
        }
        let _ = running.reflector_task.await;
        running.reconcile.stop().await;
        info!(stored = self.store.len(), "informer disconnected");
    }

    async fn release(&self, id: u64) {
        let mut conn = self.conn.lock().await;
        self.distributor.detach(id);
        let Some(delivery) = conn.listeners.remove(&id) else { return };
        delivery.cancel.cancel();
        let _ = delivery.task.await;
        info!(listener = id, remaining = conn.listeners.len(), "listener detached");
        if conn.listeners.is_empty() {
            self.disconnect(&mut conn).await;
        }
    }
}

impl<K, S> SharedInformer<K, S>
where
    K: Resource + Clone + Send + Sync + 'static,
    S: Source<K>,
{
    pub fn new(source: Arc<S>, options: ListOptions, config: MirrorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                source,
                options,
                config,
                store: Arc::new(Indexer::new()),
                distributor: Arc::new(Distributor::new()),
                root: CancellationToken::new(),
                conn: Mutex::new(Connection::default()),
                live: ArcSwapOption::empty(),
            }),
        }
    }

    /// Subscribe with the informer's default resync period.
    pub async fn subscribe<H>(&self, handler: H) -> Result<Subscription<K, S>>
    where
        H: ResourceEventHandler<K>,
    {
        let period = self.shared.config.resync;
        self.subscribe_with_resync(handler, period).await
    }

    /// Subscribe with its own resync period (zero disables resync).
    ///
    /// The handler first receives the current store contents as a reset
    /// window, then every later change. The first subscriber connects the
    /// pipeline.
    pub async fn subscribe_with_resync<H>(&self, handler: H, resync: Duration) -> Result<Subscription<K, S>>
    where
        H: ResourceEventHandler<K>,
    {
        let shared = &self.shared;
        let mut conn = shared.conn.lock().await;
        if conn.stopped {
            return Err(Error::ShutDown);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let id = shared.distributor.attach(&shared.store, tx, clamp_resync(resync));
        let cancel = shared.root.child_token();
        let task = spawn_delivery(id, Arc::new(handler), rx, cancel.clone());
        conn.listeners.insert(id, Delivery { cancel, task });
        if conn.running.is_none() {
            conn.running = Some(shared.connect());
        }
        Ok(Subscription { id, shared: Some(shared.clone()) })
    }

    /// Stop the pipeline and every listener; later subscriptions fail with
    /// [`Error::ShutDown`].
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        let mut conn = shared.conn.lock().await;
        if conn.stopped {
            return;
        }
        conn.stopped = true;
        shared.disconnect(&mut conn).await;
        shared.distributor.clear();
        shared.root.cancel();
        let deliveries: Vec<_> = conn.listeners.drain().map(|(_, d)| d.task).collect();
        for t in deliveries {
            let _ = t.await;
        }
        info!("informer shut down");
    }

    pub fn is_shut_down(&self) -> bool { self.shared.root.is_cancelled() }

    /// True once the current connection's latest full List has been applied.
    pub fn has_synced(&self) -> bool { self.shared.live.load_full().is_some_and(|l| l.queue.has_synced()) }

    /// Wait until [`has_synced`](Self::has_synced); fails if the pipeline is
    /// not connected or disconnects while waiting.
    pub async fn wait_for_sync(&self) -> Result<()> {
        let mut synced = match self.shared.live.load_full() {
            Some(live) => live.queue.synced(),
            None if self.is_shut_down() => return Err(Error::ShutDown),
            None => return Err(Error::NotConnected),
        };
        synced.wait_for(|s| *s).await.map(|_| ()).map_err(|_| Error::NotConnected)
    }

    /// Resource version the reflector would resume from, while connected.
    pub fn last_sync_resource_version(&self) -> Option<String> {
        self.shared.live.load_full().and_then(|l| l.reflector.last_sync_resource_version())
    }

    /// Register a secondary index; only allowed while the store is empty.
    pub fn add_indexer(&self, name: impl Into<String>, func: impl IndexFunc<K> + 'static) -> Result<()> {
        self.shared.store.add_indexer(name, func)
    }

    pub fn lister(&self) -> Lister<K> { Lister::new(self.shared.store.clone()) }
    pub fn indexer(&self) -> Arc<Indexer<K>> { self.shared.store.clone() }

    /// Number of attached listeners.
    pub fn listeners(&self) -> usize { self.shared.distributor.len() }
}

impl<K, S> Subscription<K, S>
where
    K: Resource + Clone + Send + Sync + 'static,
    S: Source<K>,
{
    pub fn id(&self) -> u64 { self.id }

    /// Detach and wait for this listener's delivery task to finish. The last
    /// subscription to leave disconnects the pipeline.
    pub async fn unsubscribe(mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release(self.id).await;
        }
    }
}

impl<K, S> Drop for Subscription<K, S>
where
    K: Resource + Clone + Send + Sync + 'static,
    S: Source<K>,
{
    fn drop(&mut self) {
        let Some(shared) = self.shared.take() else { return };
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move { shared.release(id).await });
            }
            Err(_) => {
                shared.distributor.detach(id);
                debug!(listener = id, "subscription dropped outside a runtime; listener detached only");
            }
        }
    }
}
