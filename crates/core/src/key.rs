use std::fmt;

use kube::Resource;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Identity of one object within a resource type: `namespace/name` for
/// namespaced kinds, `name` for cluster-scoped ones.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    /// Build a key from parts. An empty namespace is treated as cluster scope.
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        match namespace {
            Some(ns) if !ns.is_empty() => Self(format!("{}/{}", ns, name)),
            _ => Self(name.to_string()),
        }
    }

    /// Derive the key from an object's metadata.
    pub fn for_object<K: Resource>(obj: &K) -> Result<Self> {
        let meta = obj.meta();
        let name = meta.name.as_deref().filter(|n| !n.is_empty()).ok_or(Error::MissingName)?;
        Ok(Self::new(meta.namespace.as_deref(), name))
    }

    pub fn as_str(&self) -> &str { &self.0 }

    pub fn namespace(&self) -> Option<&str> { self.0.split_once('/').map(|(ns, _)| ns) }

    pub fn name(&self) -> &str {
        match self.0.split_once('/') {
            Some((_, name)) => name,
            None => &self.0,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for ObjectKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// The object's `metadata.resourceVersion`, if set.
pub fn resource_version<K: Resource>(obj: &K) -> Option<&str> { obj.meta().resource_version.as_deref() }
