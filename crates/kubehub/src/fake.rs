//! In-memory scripted [`Source`] for tests and demos.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::channel::mpsc;
use futures::StreamExt;
use kmirror_core::{LabelSelector, ListOptions, ObjectKey};
use kube::{Resource, ResourceExt};
use tokio::sync::watch;

use crate::source::{Listed, Source, SourceError, WatchEvent, WatchStream};

/// Calls observed by a [`FakeSource`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Calls {
    /// Resource version passed to each List (`None` = unconditioned).
    pub lists: Vec<Option<String>>,
    /// Resource version each Watch started from.
    pub watches: Vec<String>,
}

struct Watcher<K> {
    options: ListOptions,
    tx: mpsc::UnboundedSender<Result<WatchEvent<K>, SourceError>>,
}

struct FakeState<K> {
    objects: BTreeMap<ObjectKey, K>,
    rv: u64,
    list_failures: VecDeque<SourceError>,
    watch_failures: VecDeque<SourceError>,
    watchers: Vec<Watcher<K>>,
}

/// Holds a collection like an API server would and streams changes to open
/// watches. Failures can be scripted per call.
pub struct FakeSource<K> {
    state: Mutex<FakeState<K>>,
    calls: watch::Sender<Calls>,
}

fn in_scope<K: Resource>(options: &ListOptions, obj: &K) -> bool {
    if let Some(ns) = options.namespace.as_deref() {
        if obj.meta().namespace.as_deref() != Some(ns) {
            return false;
        }
    }
    match options.label_selector.as_deref().map(str::parse::<LabelSelector>) {
        Some(Ok(sel)) => sel.matches(obj.labels()),
        Some(Err(_)) => false,
        None => true,
    }
}

impl<K> Default for FakeSource<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    fn default() -> Self { Self::new() }
}

impl<K> FakeSource<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (calls, _) = watch::channel(Calls::default());
        Self {
            state: Mutex::new(FakeState {
                objects: BTreeMap::new(),
                rv: 0,
                list_failures: VecDeque::new(),
                watch_failures: VecDeque::new(),
                watchers: Vec::new(),
            }),
            calls,
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState<K>> { self.state.lock().unwrap_or_else(PoisonError::into_inner) }

    fn broadcast(st: &mut FakeState<K>, obj: &K, make: impl Fn(K) -> WatchEvent<K>) {
        st.watchers.retain(|w| {
            if !in_scope(&w.options, obj) {
                return !w.tx.is_closed();
            }
            w.tx.unbounded_send(Ok(make(obj.clone()))).is_ok()
        });
    }

    /// Create or update an object, stamping the next resource version, and
    /// notify open watches. Returns the stored object.
    pub fn apply(&self, mut obj: K) -> K {
        let mut st = self.lock();
        st.rv += 1;
        obj.meta_mut().resource_version = Some(st.rv.to_string());
        let Ok(key) = ObjectKey::for_object(&obj) else { return obj };
        let existed = st.objects.insert(key, obj.clone()).is_some();
        if existed {
            Self::broadcast(&mut st, &obj, WatchEvent::Modified);
        } else {
            Self::broadcast(&mut st, &obj, WatchEvent::Added);
        }
        obj
    }

    /// Delete an object and notify open watches.
    pub fn remove(&self, key: &ObjectKey) -> Option<K> {
        let mut st = self.lock();
        let mut obj = st.objects.remove(key)?;
        st.rv += 1;
        obj.meta_mut().resource_version = Some(st.rv.to_string());
        Self::broadcast(&mut st, &obj, WatchEvent::Deleted);
        Some(obj)
    }

    /// Change the collection without telling anyone (visible on the next List).
    pub fn apply_silently(&self, mut obj: K) {
        let mut st = self.lock();
        st.rv += 1;
        obj.meta_mut().resource_version = Some(st.rv.to_string());
        if let Ok(key) = ObjectKey::for_object(&obj) {
            st.objects.insert(key, obj);
        }
    }

    pub fn remove_silently(&self, key: &ObjectKey) {
        let mut st = self.lock();
        if st.objects.remove(key).is_some() {
            st.rv += 1;
        }
    }

    /// Send a raw item to every open watch.
    pub fn inject(&self, item: Result<WatchEvent<K>, SourceError>) {
        let mut st = self.lock();
        st.watchers.retain(|w| w.tx.unbounded_send(item.clone()).is_ok());
    }

    /// End every open watch stream.
    pub fn close_watches(&self) { self.lock().watchers.clear(); }

    pub fn fail_next_list(&self, err: SourceError) { self.lock().list_failures.push_back(err); }
    pub fn fail_next_watch(&self, err: SourceError) { self.lock().watch_failures.push_back(err); }

    pub fn resource_version(&self) -> String { self.lock().rv.to_string() }
    pub fn open_watches(&self) -> usize {
        let mut st = self.lock();
        st.watchers.retain(|w| !w.tx.is_closed());
        st.watchers.len()
    }

    pub fn calls(&self) -> Calls { self.calls.borrow().clone() }

    /// Wait until at least `lists` Lists and `watches` Watches were issued.
    pub async fn wait_for_calls(&self, lists: usize, watches: usize) -> Calls {
        let mut rx = self.calls.subscribe();
        let calls = rx.wait_for(|c| c.lists.len() >= lists && c.watches.len() >= watches).await;
        match calls {
            Ok(c) => c.clone(),
            Err(_) => self.calls(),
        }
    }
}

#[async_trait::async_trait]
impl<K> Source<K> for FakeSource<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    async fn list(&self, options: &ListOptions, resource_version: Option<&str>) -> Result<Listed<K>, SourceError> {
        let res = {
            let mut st = self.lock();
            match st.list_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(Listed {
                    items: st.objects.values().filter(|o| in_scope(options, *o)).cloned().collect(),
                    resource_version: st.rv.to_string(),
                }),
            }
        };
        self.calls.send_modify(|c| c.lists.push(resource_version.map(str::to_string)));
        res
    }

    async fn watch(&self, options: &ListOptions, resource_version: &str, _timeout_secs: u32) -> Result<WatchStream<K>, SourceError> {
        let res = {
            let mut st = self.lock();
            match st.watch_failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    let (tx, rx) = mpsc::unbounded();
                    st.watchers.push(Watcher { options: options.clone(), tx });
                    Ok(rx.boxed())
                }
            }
        };
        self.calls.send_modify(|c| c.watches.push(resource_version.to_string()));
        res
    }
}
