use std::sync::Arc;

use kmirror_core::{LabelSelector, ObjectKey};
use kube::{Resource, ResourceExt};

use crate::{Indexer, NAMESPACE_INDEX};

/// Read-only view over an [`Indexer`].
pub struct Lister<K> {
    indexer: Arc<Indexer<K>>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self { Self { indexer: Arc::clone(&self.indexer) } }
}

impl<K: Resource> Lister<K> {
    pub fn new(indexer: Arc<Indexer<K>>) -> Self { Self { indexer } }

    pub fn list(&self) -> Vec<Arc<K>> { self.indexer.list() }

    pub fn list_matching(&self, selector: &LabelSelector) -> Vec<Arc<K>> {
        self.indexer.list().into_iter().filter(|o| selector.matches(o.labels())).collect()
    }

    /// Cluster-scoped lookup by name.
    pub fn get(&self, name: &str) -> Option<Arc<K>> { self.indexer.get(&ObjectKey::new(None, name)) }

    pub fn namespaced(&self, namespace: impl Into<String>) -> NamespaceLister<K> {
        NamespaceLister { indexer: Arc::clone(&self.indexer), namespace: namespace.into() }
    }
}

/// Lister scoped to one namespace through the namespace index.
pub struct NamespaceLister<K> {
    indexer: Arc<Indexer<K>>,
    namespace: String,
}

impl<K: Resource> NamespaceLister<K> {
    pub fn namespace(&self) -> &str { &self.namespace }

    pub fn list(&self) -> Vec<Arc<K>> {
        // the namespace index is registered on every Indexer
        self.indexer.by_index(NAMESPACE_INDEX, &self.namespace).unwrap_or_default()
    }

    pub fn list_matching(&self, selector: &LabelSelector) -> Vec<Arc<K>> {
        self.list().into_iter().filter(|o| selector.matches(o.labels())).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<K>> { self.indexer.get(&ObjectKey::new(Some(&self.namespace), name)) }
}
