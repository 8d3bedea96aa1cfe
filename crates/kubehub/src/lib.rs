//! Console kubehub: resolves resource kinds and adapts kube list/get/watch
//! onto the console `DataService` seam.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use console_core::prelude::*;

/// A served resource kind, addressed by its plural name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveredResource {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl DiscoveredResource {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

/// Discover served resources (incl. CRDs), sorted by group/version/kind.
pub async fn discover(client: Client) -> Result<Vec<DiscoveredResource>> {
    let discovery = Discovery::new(client).run().await.context("running api discovery")?;
    let mut out = Vec::new();
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            out.push(DiscoveredResource {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
        }
    }
    out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
    Ok(out)
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn to_resource(obj: &DynamicObject) -> Result<Resource> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(Resource::new(raw))
}

/// Map a kube client error onto the fetch taxonomy.
pub fn fetch_error(kind: &str, name: Option<&str>, e: kube::Error) -> FetchError {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => FetchError::not_found(kind, name.unwrap_or("")),
        kube::Error::Api(resp) if resp.code == 401 || resp.code == 403 => FetchError::Forbidden(resp.message),
        kube::Error::SerdeError(e) => FetchError::Decode(e.to_string()),
        other => FetchError::Transport(other.to_string()),
    }
}

/// `DataService` backed by a live cluster.
///
/// Kinds are plural resource names (`backingserviceinstances`); each is resolved
/// through discovery once and cached.
pub struct KubeDataService {
    client: Client,
    resolved: Mutex<FxHashMap<String, (ApiResource, bool)>>,
}

impl KubeDataService {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: Mutex::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn cached(&self, kind: &str) -> Option<(ApiResource, bool)> {
        self.resolved.lock().ok().and_then(|m| m.get(kind).cloned())
    }

    async fn resolve(&self, kind: &str) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.cached(kind) {
            return Ok(hit);
        }
        let t0 = Instant::now();
        let discovery = Discovery::new(self.client.clone()).run().await.context("running api discovery")?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.plural == kind || ar.kind.eq_ignore_ascii_case(kind) {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(kind = %kind, gvk = %format!("{}/{}/{}", ar.group, ar.version, ar.kind), took_ms = %t0.elapsed().as_millis(), "kind resolved");
                    if let Ok(mut m) = self.resolved.lock() {
                        m.insert(kind.to_string(), (ar.clone(), namespaced));
                    }
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(anyhow!("resource kind not served: {}", kind))
    }

    async fn api_for(&self, kind: &str, ctx: &ViewContext) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(kind).await?;
        let api = match (namespaced, ctx.scope()) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        };
        Ok(api)
    }
}

#[async_trait]
impl DataService for KubeDataService {
    async fn list(&self, kind: &str, ctx: &ViewContext) -> Result<RawCollection, FetchError> {
        let t0 = Instant::now();
        let api = self.api_for(kind, ctx).await.map_err(|e| FetchError::Transport(format!("{e:#}")))?;
        let list = api.list(&ListParams::default()).await.map_err(|e| fetch_error(kind, None, e))?;
        let items = list
            .items
            .iter()
            .map(to_resource)
            .collect::<Result<Vec<_>>>()
            .map_err(|e| FetchError::Decode(format!("{e:#}")))?;
        metrics::histogram!("console_list_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(kind = %kind, ns = ?ctx.scope(), items = items.len(), took_ms = %t0.elapsed().as_millis(), "kubehub: list ok");
        Ok(RawCollection(items))
    }

    async fn get(&self, kind: &str, name: &str, ctx: &ViewContext) -> Result<Resource, FetchError> {
        let api = self.api_for(kind, ctx).await.map_err(|e| FetchError::Transport(format!("{e:#}")))?;
        let obj = api.get(name).await.map_err(|e| fetch_error(kind, Some(name), e))?;
        to_resource(&obj).map_err(|e| FetchError::Decode(format!("{e:#}")))
    }

    async fn watch(&self, kind: &str, ctx: &ViewContext) -> Result<EventStream, WatchTransportError> {
        let api = self
            .api_for(kind, ctx)
            .await
            .map_err(|e| WatchTransportError::Establish(format!("{e:#}")))?;
        info!(kind = %kind, ns = ?ctx.scope(), "kubehub: watcher started");
        // Reconnection is the watcher's business: backoff keeps the stream alive across drops.
        let stream = watcher::watcher(api, watcher::Config::default())
            .default_backoff()
            .map(|ev| match ev {
                Ok(watcher::Event::Applied(o)) => to_resource(&o)
                    .map(WatchEvent::Applied)
                    .map_err(|e| WatchTransportError::Interrupted(format!("{e:#}"))),
                Ok(watcher::Event::Deleted(o)) => to_resource(&o)
                    .map(WatchEvent::Deleted)
                    .map_err(|e| WatchTransportError::Interrupted(format!("{e:#}"))),
                Ok(watcher::Event::Restarted(list)) => {
                    debug!(count = list.len(), "watch restart");
                    list.iter()
                        .map(to_resource)
                        .collect::<Result<Vec<_>>>()
                        .map(WatchEvent::Restarted)
                        .map_err(|e| WatchTransportError::Interrupted(format!("{e:#}")))
                }
                Err(e) => {
                    warn!(error = %e, "kubehub: watch error");
                    Err(WatchTransportError::Interrupted(e.to_string()))
                }
            });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("code {code}"), reason: "x".into(), code })
    }

    #[test]
    fn strips_managed_fields_only() {
        let mut v = serde_json::json!({ "metadata": { "name": "a", "managedFields": [{}] }, "spec": {} });
        strip_managed_fields(&mut v);
        assert!(v["metadata"].get("managedFields").is_none());
        assert_eq!(v["metadata"]["name"], "a");
    }

    #[test]
    fn maps_api_errors() {
        assert_eq!(fetch_error("applications", Some("web"), api_err(404)), FetchError::not_found("applications", "web"));
        assert!(matches!(fetch_error("applications", None, api_err(403)), FetchError::Forbidden(_)));
        assert!(matches!(fetch_error("applications", None, api_err(500)), FetchError::Transport(_)));
    }

    #[test]
    fn gvk_key_omits_core_group() {
        let r = DiscoveredResource { group: String::new(), version: "v1".into(), kind: "Route".into(), plural: "routes".into(), namespaced: true };
        assert_eq!(r.gvk_key(), "v1/Route");
    }
}
