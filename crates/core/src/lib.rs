//! Console core types: resources, indexed collections and the data service seam.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;

pub use config::ConsoleConfig;
pub use error::{ConfigError, FetchError, WatchTransportError};

/// Field path every collection in the console is keyed by.
pub const NAME_PATH: &str = "metadata.name";

/// Resolve a dotted path (`spec.plans.0.id`) inside a JSON value.
/// Numeric segments index into arrays.
pub fn lookup<'a>(v: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut cur = v;
    for seg in path.split('.').filter(|s| !s.is_empty()) {
        cur = match cur {
            serde_json::Value::Object(map) => map.get(seg)?,
            serde_json::Value::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Render a scalar as an index key. Objects, arrays and null have no key.
fn scalar_key(v: &serde_json::Value) -> Option<String> {
    match v {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// An opaque cluster object plus the labels derived for it client-side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Resource {
    pub raw: serde_json::Value,
    /// Additive labels attached by joins (e.g. `bsName`). Never sent back to the server.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub derived: BTreeMap<String, String>,
}

impl Resource {
    pub fn new(raw: serde_json::Value) -> Self {
        Self { raw, derived: BTreeMap::new() }
    }

    pub fn name(&self) -> Option<&str> {
        self.field_str(NAME_PATH)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.field_str("metadata.namespace")
    }

    /// Seconds since epoch from `metadata.creationTimestamp`, 0 when absent or malformed.
    pub fn creation_ts(&self) -> i64 {
        self.field_str("metadata.creationTimestamp")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0)
    }

    pub fn field(&self, path: &str) -> Option<&serde_json::Value> {
        lookup(&self.raw, path)
    }

    pub fn field_str(&self, path: &str) -> Option<&str> {
        self.field(path).and_then(|v| v.as_str())
    }

    pub fn derived(&self, key: &str) -> Option<&str> {
        self.derived.get(key).map(String::as_str)
    }

    pub fn set_derived(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.derived.insert(key.into(), value.into());
    }
}

impl From<serde_json::Value> for Resource {
    fn from(raw: serde_json::Value) -> Self {
        Self::new(raw)
    }
}

/// Unindexed result of a list call, in server order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawCollection(pub Vec<Resource>);

impl RawCollection {
    /// Index items by the scalar found at `path`. Items without that field are dropped;
    /// on duplicate keys the later item wins.
    pub fn by(&self, path: &str) -> IndexedCollection {
        self.0
            .iter()
            .filter_map(|r| r.field(path).and_then(scalar_key).map(|k| (k, r.clone())))
            .collect()
    }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl From<Vec<Resource>> for RawCollection {
    fn from(v: Vec<Resource>) -> Self { Self(v) }
}

/// Mapping from a key (usually the resource name) to the resource.
///
/// Always rebuilt wholesale from a fresh listing; iteration is in key order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IndexedCollection(BTreeMap<String, Resource>);

impl IndexedCollection {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn get(&self, key: &str) -> Option<&Resource> { self.0.get(key) }
    pub fn get_mut(&mut self, key: &str) -> Option<&mut Resource> { self.0.get_mut(key) }
    pub fn contains_key(&self, key: &str) -> bool { self.0.contains_key(key) }

    pub fn insert(&mut self, key: impl Into<String>, res: Resource) -> Option<Resource> {
        self.0.insert(key.into(), res)
    }

    pub fn remove(&mut self, key: &str) -> Option<Resource> { self.0.remove(key) }

    pub fn keys(&self) -> impl Iterator<Item = &str> { self.0.keys().map(String::as_str) }
    pub fn values(&self) -> impl Iterator<Item = &Resource> { self.0.values() }
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Resource)> { self.0.iter().map(|(k, v)| (k.as_str(), v)) }
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Resource)> {
        self.0.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    /// Re-key the same resources by another path.
    pub fn reindex(&self, path: &str) -> IndexedCollection {
        self.to_raw().by(path)
    }

    pub fn to_raw(&self) -> RawCollection {
        RawCollection(self.0.values().cloned().collect())
    }
}

impl FromIterator<(String, Resource)> for IndexedCollection {
    fn from_iter<I: IntoIterator<Item = (String, Resource)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a IndexedCollection {
    type Item = (&'a String, &'a Resource);
    type IntoIter = std::collections::btree_map::Iter<'a, String, Resource>;
    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

/// Project/namespace scope for every list and watch call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewContext {
    pub project: Option<String>,
    pub namespace: Option<String>,
}

impl ViewContext {
    /// A project context; projects map one-to-one onto namespaces.
    pub fn project(name: impl Into<String>) -> Self {
        let name = name.into();
        Self { project: Some(name.clone()), namespace: Some(name) }
    }

    pub fn namespace(ns: impl Into<String>) -> Self {
        Self { project: None, namespace: Some(ns.into()) }
    }

    /// Cluster-wide scope.
    pub fn cluster() -> Self { Self::default() }

    /// Effective namespace: explicit namespace first, then the project.
    pub fn scope(&self) -> Option<&str> {
        self.namespace.as_deref().or(self.project.as_deref())
    }
}

/// Change that produced a snapshot. The initial delivery carries no action.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WatchAction {
    Added,
    Modified,
    Deleted,
    /// The transport re-listed after the initial load.
    Resynced,
}

impl WatchAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchAction::Added => "ADDED",
            WatchAction::Modified => "MODIFIED",
            WatchAction::Deleted => "DELETED",
            WatchAction::Resynced => "RESYNCED",
        }
    }
}

impl std::fmt::Display for WatchAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw event from a watch transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Full listing; replaces everything known so far.
    Restarted(Vec<Resource>),
    /// Object created or updated.
    Applied(Resource),
    Deleted(Resource),
}

pub type EventStream = BoxStream<'static, Result<WatchEvent, WatchTransportError>>;

/// Remote data service: the only I/O boundary of the console.
#[async_trait::async_trait]
pub trait DataService: Send + Sync {
    /// One-shot listing of `kind` within `ctx`.
    async fn list(&self, kind: &str, ctx: &ViewContext) -> Result<RawCollection, FetchError>;

    /// One-shot fetch of a single named object.
    async fn get(&self, kind: &str, name: &str, ctx: &ViewContext) -> Result<Resource, FetchError>;

    /// Open a live event stream. The first item is expected to be `Restarted`
    /// with the current listing.
    async fn watch(&self, kind: &str, ctx: &ViewContext) -> Result<EventStream, WatchTransportError>;
}

pub mod prelude {
    pub use super::{
        DataService, EventStream, FetchError, IndexedCollection, RawCollection, Resource, ViewContext,
        WatchAction, WatchEvent, WatchTransportError, NAME_PATH,
    };
}
