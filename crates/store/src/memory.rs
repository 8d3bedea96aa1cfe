//! In-RAM `DataService` for tests and demos.
//!
//! Objects live in per-kind, per-namespace buckets. Watchers get a `Restarted`
//! listing first and then every mutation made through this service.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use console_core::prelude::*;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::debug;

type Bucket = BTreeMap<String, Resource>;
type EventTx = mpsc::UnboundedSender<Result<WatchEvent, WatchTransportError>>;

struct Watcher {
    kind: String,
    ns: Option<String>,
    tx: EventTx,
}

#[derive(Default)]
struct MemState {
    objects: BTreeMap<(String, String), Bucket>,
    watchers: Vec<Watcher>,
    list_failures: BTreeMap<String, FetchError>,
    watch_failures: BTreeMap<String, WatchTransportError>,
}

impl MemState {
    fn matching(&self, kind: &str, ns: Option<&str>) -> Vec<Resource> {
        self.objects
            .iter()
            .filter(|((k, n), _)| k == kind && ns.map_or(true, |ns| ns == n))
            .flat_map(|(_, bucket)| bucket.values().cloned())
            .collect()
    }

    fn broadcast(&mut self, kind: &str, ns: &str, ev: Result<WatchEvent, WatchTransportError>) {
        self.watchers.retain(|w| {
            if w.kind != kind || w.ns.as_deref().map_or(false, |wns| wns != ns) {
                return !w.tx.is_closed();
            }
            w.tx.send(ev.clone()).is_ok()
        });
    }
}

#[derive(Default)]
pub struct MemoryDataService {
    state: Mutex<MemState>,
    list_calls: AtomicUsize,
}

impl MemoryDataService {
    pub fn new() -> Self { Self::default() }

    fn state(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create or replace an object; its namespace comes from `metadata.namespace`.
    pub fn apply(&self, kind: &str, res: Resource) {
        let Some(name) = res.name().map(str::to_string) else { return };
        let ns = res.namespace().unwrap_or_default().to_string();
        let mut st = self.state();
        st.objects.entry((kind.to_string(), ns.clone())).or_default().insert(name, res.clone());
        st.broadcast(kind, &ns, Ok(WatchEvent::Applied(res)));
    }

    /// Parse `raw` and apply it.
    pub fn apply_json(&self, kind: &str, raw: serde_json::Value) {
        self.apply(kind, Resource::new(raw));
    }

    pub fn delete(&self, kind: &str, ns: &str, name: &str) -> Option<Resource> {
        let mut st = self.state();
        let removed = st.objects.get_mut(&(kind.to_string(), ns.to_string()))?.remove(name)?;
        st.broadcast(kind, ns, Ok(WatchEvent::Deleted(removed.clone())));
        Some(removed)
    }

    /// Replace a whole namespace bucket and push a `Restarted` listing to watchers.
    pub fn relist(&self, kind: &str, ns: &str, items: Vec<Resource>) {
        let mut st = self.state();
        let bucket: Bucket = items.into_iter().filter_map(|r| Some((r.name()?.to_string(), r))).collect();
        st.objects.insert((kind.to_string(), ns.to_string()), bucket);
        let listing = st.matching(kind, Some(ns));
        st.broadcast(kind, ns, Ok(WatchEvent::Restarted(listing)));
    }

    /// Make every subsequent `list`/`get` of `kind` fail with `err`; `None` clears it.
    pub fn fail_lists(&self, kind: &str, err: Option<FetchError>) {
        let mut st = self.state();
        match err {
            Some(e) => { st.list_failures.insert(kind.to_string(), e); }
            None => { st.list_failures.remove(kind); }
        }
    }

    /// Make every subsequent `watch` of `kind` fail to establish; `None` clears it.
    pub fn fail_watches(&self, kind: &str, err: Option<WatchTransportError>) {
        let mut st = self.state();
        match err {
            Some(e) => { st.watch_failures.insert(kind.to_string(), e); }
            None => { st.watch_failures.remove(kind); }
        }
    }

    /// Push a transport error into every open watch of `kind`.
    pub fn interrupt(&self, kind: &str, reason: &str) {
        let mut st = self.state();
        let err = WatchTransportError::Interrupted(reason.to_string());
        st.watchers.retain(|w| w.kind != kind || w.tx.send(Err(err.clone())).is_ok());
    }

    /// End every open watch stream of `kind`.
    pub fn close_watches(&self, kind: &str) {
        self.state().watchers.retain(|w| w.kind != kind);
    }

    /// Number of open watch streams for `kind` whose consumer is still alive.
    pub fn watcher_count(&self, kind: &str) -> usize {
        let mut st = self.state();
        st.watchers.retain(|w| !w.tx.is_closed());
        st.watchers.iter().filter(|w| w.kind == kind).count()
    }

    /// Total `list` calls served so far.
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataService for MemoryDataService {
    async fn list(&self, kind: &str, ctx: &ViewContext) -> Result<RawCollection, FetchError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let st = self.state();
        if let Some(e) = st.list_failures.get(kind) {
            return Err(e.clone());
        }
        Ok(RawCollection(st.matching(kind, ctx.scope())))
    }

    async fn get(&self, kind: &str, name: &str, ctx: &ViewContext) -> Result<Resource, FetchError> {
        let st = self.state();
        if let Some(e) = st.list_failures.get(kind) {
            return Err(e.clone());
        }
        st.matching(kind, ctx.scope())
            .into_iter()
            .find(|r| r.name() == Some(name))
            .ok_or_else(|| FetchError::not_found(kind, name))
    }

    async fn watch(&self, kind: &str, ctx: &ViewContext) -> Result<EventStream, WatchTransportError> {
        let mut st = self.state();
        if let Some(e) = st.watch_failures.get(kind) {
            return Err(e.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let ns = ctx.scope().map(str::to_string);
        let _ = tx.send(Ok(WatchEvent::Restarted(st.matching(kind, ns.as_deref()))));
        st.watchers.push(Watcher { kind: kind.to_string(), ns, tx });
        debug!(kind = %kind, ns = ?ctx.scope(), "memory: watch opened");
        let stream = futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) });
        Ok(stream.boxed())
    }
}
