//! One subscriber: its delivery queue, resync cadence and delivery task.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{Notification, ResourceEventHandler};

/// Shortest resync period a listener may ask for.
pub const MIN_RESYNC_PERIOD: Duration = Duration::from_secs(1);

/// Zero disables resync; anything shorter than [`MIN_RESYNC_PERIOD`] is raised to it.
pub(crate) fn clamp_resync(period: Duration) -> Option<Duration> {
    if period.is_zero() {
        return None;
    }
    if period < MIN_RESYNC_PERIOD {
        warn!(requested_ms = %period.as_millis(), "resync period raised to minimum");
        return Some(MIN_RESYNC_PERIOD);
    }
    Some(period)
}

/// Registry entry for a listener, owned by the distributor.
pub(crate) struct ListenerEntry<K> {
    pub(crate) id: u64,
    tx: mpsc::UnboundedSender<Notification<K>>,
    resync: Option<Duration>,
    next_resync: Option<Instant>,
    /// Whether the resync currently in progress was requested by this listener.
    pub(crate) syncing: bool,
    /// Broadcasts at or below this store sequence are already in the listener's reset window.
    pub(crate) skip_through: u64,
    /// A List's window opened while this listener was attached.
    pub(crate) in_window: bool,
}

impl<K> ListenerEntry<K> {
    pub(crate) fn new(id: u64, tx: mpsc::UnboundedSender<Notification<K>>, resync: Option<Duration>, now: Instant) -> Self {
        Self { id, tx, resync, next_resync: resync.map(|p| now + p), syncing: false, skip_through: 0, in_window: false }
    }

    pub(crate) fn send(&self, n: Notification<K>) {
        if self.tx.send(n).is_err() {
            debug!(listener = self.id, "listener queue closed; dropping notification");
        }
    }

    /// Mark this listener as syncing if its resync is due, and schedule the next one.
    pub(crate) fn check_resync(&mut self, now: Instant) -> bool {
        self.syncing = match (self.resync, self.next_resync) {
            (Some(period), Some(due)) if now >= due => {
                self.next_resync = Some(now + period);
                true
            }
            _ => false,
        };
        self.syncing
    }
}

async fn dispatch<K>(handler: &dyn ResourceEventHandler<K>, n: Notification<K>) -> anyhow::Result<()>
where
    K: Send + Sync + 'static,
{
    match n {
        Notification::Add(obj) => handler.on_add(obj).await,
        Notification::Update { old, new } => handler.on_update(old, new).await,
        Notification::Delete { obj, final_state_unknown } => handler.on_delete(obj, final_state_unknown).await,
        Notification::Reset(marker) => handler.on_reset(marker).await,
    }
}

/// Drain the listener's queue into its handler until cancelled or the queue closes.
pub(crate) fn spawn_delivery<K>(
    id: u64,
    handler: Arc<dyn ResourceEventHandler<K>>,
    mut rx: mpsc::UnboundedReceiver<Notification<K>>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    K: Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                n = rx.recv() => n,
            };
            let Some(n) = next else { break };
            let kind = n.kind();
            match AssertUnwindSafe(dispatch(handler.as_ref(), n)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(listener = id, kind, error = %e, "handler failed");
                    metrics::counter!("kmirror_listener_handler_failures_total", 1u64, "reason" => "error");
                }
                Err(_) => {
                    warn!(listener = id, kind, "handler panicked");
                    metrics::counter!("kmirror_listener_handler_failures_total", 1u64, "reason" => "panic");
                }
            }
        }
        debug!(listener = id, "delivery stopped");
    })
}
