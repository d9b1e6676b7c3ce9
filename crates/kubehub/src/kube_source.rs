//! [`Source`] backed by the Kubernetes API through `kube::Api`.

use std::fmt::Debug;
use std::sync::Arc;

use futures::{StreamExt, TryStreamExt};
use kmirror_core::ListOptions;
use kube::{
    api::{Api, ListParams, VersionMatch, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind, NamespaceResourceScope},
    discovery::{Discovery, Scope},
    Client, Resource,
};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::source::{Listed, Source, SourceError, WatchEvent, WatchStream};

/// Largest watch timeout the API server accepts without complaint.
const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

type ApiFactory<K> = Arc<dyn Fn(Option<&str>) -> Api<K> + Send + Sync>;

pub struct KubeSource<K> {
    api_for: ApiFactory<K>,
    strip_managed_fields: bool,
}

impl<K> KubeSource<K>
where
    K: Resource<Scope = NamespaceResourceScope> + 'static,
    K::DynamicType: Default,
{
    /// Namespaced kind; `ListOptions::namespace` picks the namespace, `None` watches all.
    pub fn namespaced(client: Client) -> Self {
        Self::from_factory(Arc::new(move |ns: Option<&str>| match ns {
            Some(ns) => Api::namespaced(client.clone(), ns),
            None => Api::all(client.clone()),
        }))
    }
}

impl<K> KubeSource<K>
where
    K: Resource + 'static,
    K::DynamicType: Default,
{
    /// Cluster-scoped kind; any namespace in the options is ignored.
    pub fn cluster(client: Client) -> Self {
        Self::from_factory(Arc::new(move |ns: Option<&str>| {
            if let Some(ns) = ns {
                warn!(ns = %ns, "namespace ignored for cluster-scoped kind");
            }
            Api::all(client.clone())
        }))
    }
}

impl KubeSource<DynamicObject> {
    /// Untyped kind resolved through discovery.
    pub fn dynamic(client: Client, ar: ApiResource, namespaced: bool) -> Self {
        Self::from_factory(Arc::new(move |ns: Option<&str>| match ns {
            Some(ns) if namespaced => Api::namespaced_with(client.clone(), ns, &ar),
            _ => Api::all_with(client.clone(), &ar),
        }))
    }

    /// Resolve a GVK key (`v1/ConfigMap` or `group/v1/Kind`) and build a source for it.
    pub async fn for_gvk(client: Client, gvk_key: &str) -> Result<(Self, bool), SourceError> {
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        Ok((Self::dynamic(client, ar, namespaced), namespaced))
    }
}

impl<K> KubeSource<K> {
    pub fn from_factory(api_for: ApiFactory<K>) -> Self { Self { api_for, strip_managed_fields: true } }

    /// Keep `metadata.managedFields` on mirrored objects (dropped by default).
    pub fn keep_managed_fields(mut self) -> Self {
        self.strip_managed_fields = false;
        self
    }
}

fn list_params(options: &ListOptions, resource_version: Option<&str>) -> ListParams {
    let mut lp = ListParams::default();
    if let Some(l) = options.label_selector.as_deref() {
        lp = lp.labels(l);
    }
    if let Some(f) = options.field_selector.as_deref() {
        lp = lp.fields(f);
    }
    if let Some(rv) = resource_version {
        lp.resource_version = Some(rv.to_string());
        lp.version_match = Some(VersionMatch::NotOlderThan);
    }
    lp
}

fn watch_params(options: &ListOptions, timeout_secs: u32) -> WatchParams {
    let mut wp = WatchParams::default().timeout(timeout_secs.min(MAX_WATCH_TIMEOUT_SECS));
    if let Some(l) = options.label_selector.as_deref() {
        wp = wp.labels(l);
    }
    if let Some(f) = options.field_selector.as_deref() {
        wp = wp.fields(f);
    }
    wp
}

fn strip<K: Resource>(mut obj: K, enabled: bool) -> K {
    if enabled {
        obj.meta_mut().managed_fields = None;
    }
    obj
}

#[async_trait::async_trait]
impl<K> Source<K> for KubeSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn list(&self, options: &ListOptions, resource_version: Option<&str>) -> Result<Listed<K>, SourceError> {
        let api = (self.api_for)(options.namespace.as_deref());
        let list = api.list(&list_params(options, resource_version)).await?;
        let resource_version = list.metadata.resource_version.clone().unwrap_or_default();
        let strip_enabled = self.strip_managed_fields;
        let items: Vec<K> = list.items.into_iter().map(|o| strip(o, strip_enabled)).collect();
        debug!(items = items.len(), rv = %resource_version, "kube list");
        Ok(Listed { items, resource_version })
    }

    async fn watch(&self, options: &ListOptions, resource_version: &str, timeout_secs: u32) -> Result<WatchStream<K>, SourceError> {
        let api = (self.api_for)(options.namespace.as_deref());
        let stream = api.watch(&watch_params(options, timeout_secs), resource_version).await?;
        let strip_enabled = self.strip_managed_fields;
        Ok(stream
            .map_err(SourceError::from)
            .map_ok(move |ev| match ev {
                kube::api::WatchEvent::Added(o) => WatchEvent::Added(strip(o, strip_enabled)),
                kube::api::WatchEvent::Modified(o) => WatchEvent::Modified(strip(o, strip_enabled)),
                kube::api::WatchEvent::Deleted(o) => WatchEvent::Deleted(strip(o, strip_enabled)),
                kube::api::WatchEvent::Bookmark(b) => WatchEvent::Bookmark { resource_version: b.metadata.resource_version },
                kube::api::WatchEvent::Error(e) => WatchEvent::Error { code: e.code, message: e.message },
            })
            .boxed())
    }
}

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind, SourceError> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() }),
        [group, version, kind] => Ok(GroupVersionKind { group: (*group).to_string(), version: (*version).to_string(), kind: (*kind).to_string() }),
        _ => Err(SourceError::UnknownKind(format!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key))),
    }
}

async fn find_api_resource(client: Client, gvk: &GroupVersionKind) -> Result<(ApiResource, bool), SourceError> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar, namespaced));
            }
        }
    }
    Err(SourceError::UnknownKind(format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys() {
        let core = parse_gvk_key("v1/ConfigMap").unwrap();
        assert_eq!((core.group.as_str(), core.version.as_str(), core.kind.as_str()), ("", "v1", "ConfigMap"));
        let crd = parse_gvk_key("cert-manager.io/v1/Certificate").unwrap();
        assert_eq!(crd.group, "cert-manager.io");
        assert!(parse_gvk_key("Certificate").is_err());
    }

    #[test]
    fn list_params_condition_on_resource_version() {
        let opts = ListOptions::default().fields("metadata.name=x");
        let lp = list_params(&opts, None);
        assert_eq!(lp.resource_version, None);
        assert_eq!(lp.field_selector.as_deref(), Some("metadata.name=x"));
        let lp = list_params(&opts, Some("42"));
        assert_eq!(lp.resource_version.as_deref(), Some("42"));
        assert!(matches!(lp.version_match, Some(VersionMatch::NotOlderThan)));
    }

    #[test]
    fn watch_timeout_is_capped() {
        let wp = watch_params(&ListOptions::default(), 10_000);
        assert_eq!(wp.timeout, Some(MAX_WATCH_TIMEOUT_SECS));
        assert!(wp.bookmarks);
    }
}
