use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaType {
    Added,
    Updated,
    Deleted,
    /// Item of a full List (initial population or relist).
    Replaced,
    /// Periodic resync; carries the stored object unchanged.
    Sync,
}

impl DeltaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeltaType::Added => "added",
            DeltaType::Updated => "updated",
            DeltaType::Deleted => "deleted",
            DeltaType::Replaced => "replaced",
            DeltaType::Sync => "sync",
        }
    }
}

/// One pending change for a key.
#[derive(Debug)]
pub struct Delta<K> {
    pub key: ObjectKey,
    pub kind: DeltaType,
    pub object: Arc<K>,
    /// Deletion inferred from absence in a relist; `object` is the last state
    /// the mirror knew, not one confirmed by the server.
    pub final_state_unknown: bool,
}

impl<K> Delta<K> {
    pub fn new(key: ObjectKey, kind: DeltaType, object: Arc<K>) -> Self {
        Self { key, kind, object, final_state_unknown: false }
    }

    pub fn deleted_final_state_unknown(key: ObjectKey, last_known: Arc<K>) -> Self {
        Self { key, kind: DeltaType::Deleted, object: last_known, final_state_unknown: true }
    }

    pub fn is_deletion(&self) -> bool { self.kind == DeltaType::Deleted }
}

impl<K> Clone for Delta<K> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            kind: self.kind,
            object: Arc::clone(&self.object),
            final_state_unknown: self.final_state_unknown,
        }
    }
}

/// Ordered chain of pending records sharing one key (oldest first).
#[derive(Debug)]
pub struct Deltas<K> {
    items: Vec<Delta<K>>,
}

impl<K> Default for Deltas<K> {
    fn default() -> Self { Self { items: Vec::new() } }
}

impl<K> Clone for Deltas<K> {
    fn clone(&self) -> Self { Self { items: self.items.clone() } }
}

impl<K> Deltas<K> {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn oldest(&self) -> Option<&Delta<K>> { self.items.first() }
    pub fn newest(&self) -> Option<&Delta<K>> { self.items.last() }
    pub fn iter(&self) -> std::slice::Iter<'_, Delta<K>> { self.items.iter() }

    /// Append and coalesce a trailing pair of deletions into one.
    pub fn push(&mut self, delta: Delta<K>) {
        self.items.push(delta);
        self.dedup_tail();
    }

    fn dedup_tail(&mut self) {
        let n = self.items.len();
        if n < 2 {
            return;
        }
        if !(self.items[n - 1].is_deletion() && self.items[n - 2].is_deletion()) {
            return;
        }
        // Prefer the record carrying a server-confirmed object.
        let newer = self.items.pop();
        if let Some(newer) = newer {
            if !newer.final_state_unknown {
                self.items[n - 2] = newer;
            }
        }
    }
}

impl<K> IntoIterator for Deltas<K> {
    type Item = Delta<K>;
    type IntoIter = std::vec::IntoIter<Delta<K>>;

    fn into_iter(self) -> Self::IntoIter { self.items.into_iter() }
}

impl<'a, K> IntoIterator for &'a Deltas<K> {
    type Item = &'a Delta<K>;
    type IntoIter = std::slice::Iter<'a, Delta<K>>;

    fn into_iter(self) -> Self::IntoIter { self.items.iter() }
}
