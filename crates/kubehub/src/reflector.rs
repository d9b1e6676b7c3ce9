//! List-then-watch driver feeding a [`DeltaQueue`].

use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::StreamExt;
use kmirror_core::{resource_version, Error, ListOptions, MirrorConfig};
use kmirror_store::DeltaQueue;
use kube::Resource;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::source::{Source, SourceError, WatchEvent};

/// A watch that lived at least this long counts as healthy.
const HEALTHY_WATCH: Duration = Duration::from_secs(1);

enum ListOutcome {
    Listed,
    Failed(SourceError),
    Stopped,
}

enum WatchOutcome {
    /// Stream ended normally; re-watch from the current bookmark.
    Closed { healthy: bool },
    /// The bookmark expired; relist from scratch.
    Gone { healthy: bool },
    /// Transport failure or terminal error event; relist.
    Failed(SourceError),
    Stopped,
}

async fn sleep_or_cancel(d: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

pub struct Reflector<K, S> {
    source: Arc<S>,
    queue: Arc<DeltaQueue<K>>,
    options: ListOptions,
    config: MirrorConfig,
    last_sync_rv: Mutex<Option<String>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K, S> Reflector<K, S>
where
    K: Resource + Send + Sync + 'static,
    S: Source<K>,
{
    pub fn new(source: Arc<S>, queue: Arc<DeltaQueue<K>>, options: ListOptions, config: MirrorConfig) -> Self {
        Self { source, queue, options, config, last_sync_rv: Mutex::new(None), _kind: PhantomData }
    }

    fn rv(&self) -> MutexGuard<'_, Option<String>> { self.last_sync_rv.lock().unwrap_or_else(PoisonError::into_inner) }

    /// Resource version of the last List, watch event or bookmark seen.
    pub fn last_sync_resource_version(&self) -> Option<String> { self.rv().clone() }

    /// Drop the bookmark so the next cycle starts from an unconditioned List.
    pub fn reset(&self) { *self.rv() = None; }

    fn advance(&self, rv: Option<&str>) {
        if let Some(rv) = rv.filter(|rv| !rv.is_empty()) {
            *self.rv() = Some(rv.to_string());
        }
    }

    /// Run list/watch cycles until `cancel` fires or the queue is closed.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = Backoff::new(self.config.watch_backoff_base, self.config.watch_backoff_max);
        let mut need_list = true;
        info!(ns = ?self.options.namespace, labels = ?self.options.label_selector, "reflector started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if need_list {
                let conditioned = self.last_sync_resource_version().is_some();
                match self.list_once(&cancel).await {
                    ListOutcome::Listed => need_list = false,
                    ListOutcome::Stopped => break,
                    ListOutcome::Failed(e) if e.is_gone() && conditioned => {
                        warn!(error = %e, "list: resource version too old; relisting from scratch");
                        metrics::counter!("kmirror_reflector_relists_gone_total", 1u64);
                        self.reset();
                        continue;
                    }
                    ListOutcome::Failed(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, backoff_ms = %delay.as_millis(), "list failed; backing off");
                        if !sleep_or_cancel(delay, &cancel).await {
                            break;
                        }
                        continue;
                    }
                }
            }
            match self.watch_once(&cancel).await {
                WatchOutcome::Closed { healthy: true } => {
                    backoff.reset();
                    debug!("watch closed; resuming from bookmark");
                }
                WatchOutcome::Closed { healthy: false } => {
                    let delay = backoff.next_delay();
                    debug!(backoff_ms = %delay.as_millis(), "watch closed early; backing off");
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                }
                WatchOutcome::Gone { healthy } => {
                    warn!(healthy, "watch: resource version too old; relisting from scratch");
                    metrics::counter!("kmirror_reflector_relists_gone_total", 1u64);
                    self.reset();
                    need_list = true;
                    if healthy {
                        backoff.reset();
                    } else {
                        let delay = backoff.next_delay();
                        debug!(backoff_ms = %delay.as_millis(), "watch gone before it was healthy; backing off");
                        if !sleep_or_cancel(delay, &cancel).await {
                            break;
                        }
                    }
                }
                WatchOutcome::Failed(e) => {
                    need_list = true;
                    let delay = backoff.next_delay();
                    warn!(error = %e, backoff_ms = %delay.as_millis(), "watch failed; relisting after backoff");
                    if !sleep_or_cancel(delay, &cancel).await {
                        break;
                    }
                }
                WatchOutcome::Stopped => break,
            }
        }
        info!("reflector stopped");
    }

    async fn list_once(&self, cancel: &CancellationToken) -> ListOutcome {
        let since = self.last_sync_resource_version();
        let t0 = Instant::now();
        let res = tokio::select! {
            _ = cancel.cancelled() => return ListOutcome::Stopped,
            r = self.source.list(&self.options, since.as_deref()) => r,
        };
        let listed = match res {
            Ok(l) => l,
            Err(e) => {
                metrics::counter!("kmirror_reflector_lists_total", 1u64, "result" => "error");
                return ListOutcome::Failed(e);
            }
        };
        metrics::counter!("kmirror_reflector_lists_total", 1u64, "result" => "ok");
        let items = listed.items.len();
        if let Err(e) = self.queue.replace(listed.items, &listed.resource_version) {
            info!(error = %e, "list: queue closed; stopping");
            return ListOutcome::Stopped;
        }
        self.advance(Some(&listed.resource_version));
        info!(items, rv = %listed.resource_version, since = ?since, took_ms = %t0.elapsed().as_millis(), "list done");
        ListOutcome::Listed
    }

    async fn watch_once(&self, cancel: &CancellationToken) -> WatchOutcome {
        let rv = self.last_sync_resource_version().unwrap_or_default();
        let started = Instant::now();
        let res = tokio::select! {
            _ = cancel.cancelled() => return WatchOutcome::Stopped,
            r = self.source.watch(&self.options, &rv, self.config.watch_timeout_secs) => r,
        };
        let mut stream = match res {
            Ok(s) => s,
            Err(e) if e.is_gone() => return WatchOutcome::Gone { healthy: false },
            Err(e) => return WatchOutcome::Failed(e),
        };
        info!(rv = %rv, "watch started");
        // Object and bookmark events only; error events say nothing about health.
        let mut events = 0usize;
        let healthy = |events: usize| events > 0 || started.elapsed() >= HEALTHY_WATCH;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return WatchOutcome::Stopped,
                n = stream.next() => n,
            };
            let ev = match next {
                None => {
                    info!(events, ran_ms = %started.elapsed().as_millis(), "watch stream ended");
                    return WatchOutcome::Closed { healthy: healthy(events) };
                }
                Some(Err(SourceError::Malformed(m))) => {
                    warn!(error = %m, "watch: skipping malformed event");
                    continue;
                }
                Some(Err(e)) if e.is_gone() => return WatchOutcome::Gone { healthy: healthy(events) },
                Some(Err(e)) => return WatchOutcome::Failed(e),
                Some(Ok(ev)) => ev,
            };
            metrics::counter!("kmirror_reflector_watch_events_total", 1u64, "kind" => ev.kind());
            let (pushed, obj_rv) = match ev {
                WatchEvent::Added(o) => {
                    let rv = resource_version(&o).map(str::to_string);
                    (self.queue.add(o), rv)
                }
                WatchEvent::Modified(o) => {
                    let rv = resource_version(&o).map(str::to_string);
                    (self.queue.update(o), rv)
                }
                WatchEvent::Deleted(o) => {
                    let rv = resource_version(&o).map(str::to_string);
                    (self.queue.delete(o), rv)
                }
                WatchEvent::Bookmark { resource_version } => {
                    events += 1;
                    debug!(rv = %resource_version, "watch bookmark");
                    self.advance(Some(&resource_version));
                    continue;
                }
                WatchEvent::Error { code: 410, message } => {
                    debug!(message = %message, "watch error event: gone");
                    return WatchOutcome::Gone { healthy: healthy(events) };
                }
                WatchEvent::Error { code, message } => {
                    return WatchOutcome::Failed(SourceError::Transport(format!("watch error {}: {}", code, message)));
                }
            };
            events += 1;
            match pushed {
                Ok(()) => self.advance(obj_rv.as_deref()),
                Err(Error::ShutDown) => {
                    info!("watch: queue closed; stopping");
                    return WatchOutcome::Stopped;
                }
                Err(e) => warn!(error = %e, "watch: skipping malformed event"),
            }
        }
    }
}
