//! Mirra kubehub: discovery plus a kube-backed [`ListWatch`] source.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use futures::StreamExt;
use kube::{
    api::{Api, ListParams, WatchEvent, WatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use mirra_core::{ListPage, ListWatch, Obj, SourceError, SourceEvent, SourceEventKind, WatchStream};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespaced: bool,
}

impl DiscoveredKind {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resource kinds (incl. CRDs).
pub async fn discover() -> Result<Vec<DiscoveredKind>> {
    let client = Client::try_default().await?;
    let discovery = Discovery::new(client).run().await?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredKind {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| {
        a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind))
    });
    Ok(out)
}

fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] => Ok(GroupVersionKind {
            group: String::new(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        [group, version, kind] => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn obj_from_dynamic(o: &DynamicObject) -> Result<Obj, SourceError> {
    let name = o
        .metadata
        .name
        .clone()
        .ok_or_else(|| SourceError::Malformed("object missing metadata.name".into()))?;
    let resource_version = o
        .metadata
        .resource_version
        .clone()
        .ok_or_else(|| SourceError::Malformed("object missing metadata.resourceVersion".into()))?;
    let mut raw = serde_json::to_value(o)
        .map_err(|e| SourceError::Malformed(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(Obj { namespace: o.metadata.namespace.clone(), name, resource_version, raw })
}

fn map_kube_err(e: kube::Error) -> SourceError {
    match e {
        kube::Error::Api(ae) if ae.code == 410 => SourceError::ExpiredCursor,
        other => SourceError::Transient(other.to_string()),
    }
}

/// A [`ListWatch`] source bound to one GVK (optionally one namespace).
pub struct KubeSource {
    api: Api<DynamicObject>,
    gvk_key: String,
}

impl KubeSource {
    /// Resolve the GVK via discovery and bind the dynamic API. Failures
    /// here are configuration-class: no list can even be attempted.
    pub async fn new(gvk_key: &str, namespace: Option<&str>) -> Result<Self> {
        let client = Client::try_default().await?;
        let gvk = parse_gvk_key(gvk_key)?;
        let (ar, namespaced) = find_api_resource(client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = if namespaced {
            match namespace {
                Some(ns) => Api::namespaced_with(client, ns, &ar),
                None => Api::all_with(client, &ar),
            }
        } else {
            Api::all_with(client, &ar)
        };
        info!(gvk = %gvk_key, ns = ?namespace, "kube source bound");
        Ok(Self { api, gvk_key: gvk_key.to_string() })
    }
}

#[async_trait::async_trait]
impl ListWatch for KubeSource {
    async fn list(&self, _cursor: Option<&str>) -> Result<ListPage, SourceError> {
        // A fresh full snapshot; the API server does not resume listings
        // from an arbitrary cursor.
        let lp = ListParams::default();
        let objs = self.api.list(&lp).await.map_err(map_kube_err)?;
        let resource_version = objs.metadata.resource_version.clone().unwrap_or_default();
        let mut items = Vec::with_capacity(objs.items.len());
        for o in &objs.items {
            match obj_from_dynamic(o) {
                Ok(obj) => items.push(obj),
                Err(e) => warn!(gvk = %self.gvk_key, error = %e, "skipping undecodable list item"),
            }
        }
        debug!(gvk = %self.gvk_key, items = items.len(), rv = %resource_version, "listed");
        Ok(ListPage { items, resource_version })
    }

    async fn watch(&self, cursor: &str) -> Result<WatchStream, SourceError> {
        let wp = WatchParams::default();
        let stream = self.api.watch(&wp, cursor).await.map_err(map_kube_err)?;
        debug!(gvk = %self.gvk_key, cursor = %cursor, "watch opened");
        let mapped = stream
            .map(|r| match r {
                Ok(WatchEvent::Added(o)) => Some(
                    obj_from_dynamic(&o).map(|obj| SourceEvent { kind: SourceEventKind::Added, obj }),
                ),
                Ok(WatchEvent::Modified(o)) => Some(
                    obj_from_dynamic(&o)
                        .map(|obj| SourceEvent { kind: SourceEventKind::Updated, obj }),
                ),
                Ok(WatchEvent::Deleted(o)) => Some(
                    obj_from_dynamic(&o)
                        .map(|obj| SourceEvent { kind: SourceEventKind::Deleted, obj }),
                ),
                // Bookmarks carry no object change.
                Ok(WatchEvent::Bookmark(_)) => None,
                Ok(WatchEvent::Error(er)) if er.code == 410 => Some(Err(SourceError::ExpiredCursor)),
                Ok(WatchEvent::Error(er)) => Some(Err(SourceError::Transient(er.message))),
                Err(e) => Some(Err(map_kube_err(e))),
            })
            .filter_map(futures::future::ready)
            .boxed();
        Ok(mapped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_roundtrip() {
        let gvk = parse_gvk_key("v1/Pod").unwrap();
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
        assert_eq!(gvk.kind, "Pod");

        let gvk = parse_gvk_key("apps/v1/Deployment").unwrap();
        assert_eq!(gvk.group, "apps");
        assert!(parse_gvk_key("Pod").is_err());
    }

    #[test]
    fn dynamic_object_conversion_strips_managed_fields() {
        let mut o = DynamicObject::new(
            "web",
            &kube::core::ApiResource::from_gvk(&GroupVersionKind {
                group: String::new(),
                version: "v1".into(),
                kind: "Pod".into(),
            }),
        );
        o.metadata.namespace = Some("default".into());
        o.metadata.resource_version = Some("42".into());
        o.metadata.managed_fields = Some(vec![Default::default()]);
        let obj = obj_from_dynamic(&o).unwrap();
        assert_eq!(obj.key().to_string(), "default/web");
        assert_eq!(obj.resource_version, "42");
        assert!(obj.raw.get("metadata").and_then(|m| m.get("managedFields")).is_none());
    }

    #[test]
    fn missing_resource_version_is_malformed() {
        let o = DynamicObject::new(
            "web",
            &kube::core::ApiResource::from_gvk(&GroupVersionKind {
                group: String::new(),
                version: "v1".into(),
                kind: "Pod".into(),
            }),
        );
        assert!(matches!(obj_from_dynamic(&o), Err(SourceError::Malformed(_))));
    }
}
