//! Keyed object map with pluggable secondary indices.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use kmirror_core::{Error, ObjectKey, Result};
use kube::Resource;
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::{smallvec, SmallVec};

/// Index values an object belongs to.
pub type IndexValues = SmallVec<[String; 2]>;

/// Maps an object to the index values it belongs to (e.g. its namespace).
pub trait IndexFunc<K>: Send + Sync {
    fn index_values(&self, obj: &K) -> IndexValues;
}

impl<K, F> IndexFunc<K> for F
where
    F: Fn(&K) -> IndexValues + Send + Sync,
{
    fn index_values(&self, obj: &K) -> IndexValues { self(obj) }
}

/// Name of the index registered on every store.
pub const NAMESPACE_INDEX: &str = "namespace";

/// Namespace index function; cluster-scoped objects are not indexed.
pub fn namespace_index<K: Resource>(obj: &K) -> IndexValues {
    match obj.meta().namespace.as_deref() {
        Some(ns) if !ns.is_empty() => smallvec![ns.to_string()],
        _ => SmallVec::new(),
    }
}

/// Outcome of a single store write.
#[derive(Debug)]
pub struct Applied<K> {
    /// Store sequence number assigned to this write.
    pub seq: u64,
    /// Object previously stored under the key.
    pub old: Option<Arc<K>>,
}

type Index = FxHashMap<String, FxHashSet<ObjectKey>>;

struct Inner<K> {
    items: FxHashMap<ObjectKey, Arc<K>>,
    indexers: FxHashMap<String, Arc<dyn IndexFunc<K>>>,
    indices: FxHashMap<String, Index>,
    seq: u64,
}

impl<K> Inner<K> {
    fn update_indices(&mut self, key: &ObjectKey, old: Option<&K>, new: Option<&K>) {
        for (name, func) in self.indexers.iter() {
            let old_values = old.map(|o| func.index_values(o)).unwrap_or_default();
            let new_values = new.map(|n| func.index_values(n)).unwrap_or_default();
            if old_values == new_values {
                continue;
            }
            let index = self.indices.entry(name.clone()).or_default();
            for v in old_values.iter() {
                if let Some(set) = index.get_mut(v) {
                    set.remove(key);
                    if set.is_empty() {
                        index.remove(v);
                    }
                }
            }
            for v in new_values {
                index.entry(v).or_default().insert(key.clone());
            }
        }
    }

    fn index(&self, name: &str) -> Result<Option<&Index>> {
        if !self.indexers.contains_key(name) {
            return Err(Error::IndexNotFound(name.to_string()));
        }
        Ok(self.indices.get(name))
    }
}

/// The authoritative in-memory mirror.
///
/// One writer at a time (the reconcile loop), any number of readers. Every
/// write bumps a monotonic sequence number so readers can place a snapshot
/// relative to the change stream.
pub struct Indexer<K> {
    inner: RwLock<Inner<K>>,
}

impl<K: Resource + Send + Sync + 'static> Default for Indexer<K> {
    fn default() -> Self { Self::new() }
}

impl<K: Resource + Send + Sync + 'static> Indexer<K> {
    /// Empty store with the namespace index registered.
    pub fn new() -> Self {
        let mut indexers: FxHashMap<String, Arc<dyn IndexFunc<K>>> = FxHashMap::default();
        indexers.insert(NAMESPACE_INDEX.to_string(), Arc::new(namespace_index::<K>));
        Self {
            inner: RwLock::new(Inner {
                items: FxHashMap::default(),
                indexers,
                indices: FxHashMap::default(),
                seq: 0,
            }),
        }
    }
}

impl<K> Indexer<K> {
    fn read(&self) -> RwLockReadGuard<'_, Inner<K>> { self.inner.read().unwrap_or_else(PoisonError::into_inner) }
    fn write(&self) -> RwLockWriteGuard<'_, Inner<K>> { self.inner.write().unwrap_or_else(PoisonError::into_inner) }

    /// Register an index. Only allowed while the store is empty.
    pub fn add_indexer(&self, name: impl Into<String>, func: impl IndexFunc<K> + 'static) -> Result<()> {
        let name = name.into();
        let mut inner = self.write();
        if !inner.items.is_empty() {
            return Err(Error::StoreNotEmpty);
        }
        if inner.indexers.contains_key(&name) {
            return Err(Error::IndexExists(name));
        }
        inner.indexers.insert(name, Arc::new(func));
        Ok(())
    }

    /// Insert or replace the object under `key`.
    pub fn upsert(&self, key: ObjectKey, obj: Arc<K>) -> Applied<K> {
        let mut inner = self.write();
        let old = inner.items.insert(key.clone(), Arc::clone(&obj));
        inner.update_indices(&key, old.as_deref(), Some(&*obj));
        inner.seq += 1;
        Applied { seq: inner.seq, old }
    }

    /// Remove `key`. Still bumps the sequence when the key was absent so the
    /// caller gets a slot for its notification.
    pub fn remove(&self, key: &ObjectKey) -> Applied<K> {
        let mut inner = self.write();
        let old = inner.items.remove(key);
        if let Some(o) = old.as_deref() {
            inner.update_indices(key, Some(o), None);
        }
        inner.seq += 1;
        Applied { seq: inner.seq, old }
    }

    pub fn get(&self, key: &ObjectKey) -> Option<Arc<K>> { self.read().items.get(key).cloned() }

    pub fn list(&self) -> Vec<Arc<K>> { self.read().items.values().cloned().collect() }

    pub fn list_keys(&self) -> Vec<ObjectKey> { self.read().items.keys().cloned().collect() }

    pub fn len(&self) -> usize { self.read().items.len() }
    pub fn is_empty(&self) -> bool { self.read().items.is_empty() }

    /// Objects whose `index_name` values contain `value`.
    pub fn by_index(&self, index_name: &str, value: &str) -> Result<Vec<Arc<K>>> {
        let inner = self.read();
        let Some(keys) = inner.index(index_name)?.and_then(|i| i.get(value)) else { return Ok(Vec::new()) };
        Ok(keys.iter().filter_map(|k| inner.items.get(k).cloned()).collect())
    }

    pub fn index_keys(&self, index_name: &str, value: &str) -> Result<Vec<ObjectKey>> {
        let inner = self.read();
        let keys = inner.index(index_name)?.and_then(|i| i.get(value));
        Ok(keys.map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    /// Every value currently present in the named index.
    pub fn index_values(&self, index_name: &str) -> Result<Vec<String>> {
        let inner = self.read();
        Ok(inner.index(index_name)?.map(|i| i.keys().cloned().collect()).unwrap_or_default())
    }

    pub fn sequence(&self) -> u64 { self.read().seq }

    /// Sequence number and contents read under one lock.
    pub fn snapshot(&self) -> (u64, Vec<Arc<K>>) {
        let inner = self.read();
        (inner.seq, inner.items.values().cloned().collect())
    }
}

impl<K: Resource> Indexer<K> {
    pub fn add(&self, obj: Arc<K>) -> Result<Applied<K>> {
        let key = ObjectKey::for_object(&*obj)?;
        Ok(self.upsert(key, obj))
    }

    pub fn update(&self, obj: Arc<K>) -> Result<Applied<K>> { self.add(obj) }

    pub fn delete(&self, obj: &K) -> Result<Applied<K>> {
        let key = ObjectKey::for_object(obj)?;
        Ok(self.remove(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;

    fn cm(ns: &str, name: &str, team: &str) -> Arc<ConfigMap> {
        let mut labels = std::collections::BTreeMap::new();
        labels.insert("team".to_string(), team.to_string());
        Arc::new(ConfigMap {
            metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), labels: Some(labels), ..Default::default() },
            ..Default::default()
        })
    }

    fn by_team(obj: &ConfigMap) -> IndexValues {
        obj.metadata.labels.as_ref().and_then(|l| l.get("team")).map(|t| smallvec![t.clone()]).unwrap_or_default()
    }

    #[test]
    fn incremental_index_maintenance() {
        let idx = Indexer::<ConfigMap>::new();
        idx.add_indexer("team", by_team).unwrap();
        idx.add(cm("a", "x", "red")).unwrap();
        idx.add(cm("a", "y", "blue")).unwrap();
        idx.add(cm("b", "z", "red")).unwrap();
        assert_eq!(idx.by_index("team", "red").unwrap().len(), 2);

        idx.update(cm("a", "x", "blue")).unwrap();
        assert_eq!(idx.index_keys("team", "red").unwrap(), vec![ObjectKey::from("b/z")]);
        assert_eq!(idx.by_index("team", "blue").unwrap().len(), 2);

        idx.delete(&cm("b", "z", "red")).unwrap();
        assert!(idx.by_index("team", "red").unwrap().is_empty());
        let mut values = idx.index_values("team").unwrap();
        values.sort();
        assert_eq!(values, vec!["blue".to_string()]);
        assert_eq!(idx.index_values(NAMESPACE_INDEX).unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn sequence_advances_per_write() {
        let idx = Indexer::<ConfigMap>::new();
        assert_eq!(idx.sequence(), 0);
        let a = idx.add(cm("a", "x", "red")).unwrap();
        assert_eq!(a.seq, 1);
        assert!(a.old.is_none());
        let b = idx.update(cm("a", "x", "blue")).unwrap();
        assert_eq!(b.seq, 2);
        assert!(b.old.is_some());
        let (seq, items) = idx.snapshot();
        assert_eq!((seq, items.len()), (2, 1));
    }
}
