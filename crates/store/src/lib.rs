//! Console store: the subscription manager.
//!
//! `watch` turns a raw event stream into full snapshots delivered to a callback;
//! `release` tears subscriptions down. Snapshots are rebuilt wholesale from the
//! reducer state on every event, never patched.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use console_core::config::DEFAULT_QUEUE_CAP;
use console_core::prelude::*;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod memory;

pub use memory::MemoryDataService;

/// Folds watch events into the current object set and decides the action to report.
#[derive(Debug, Default)]
pub struct SnapshotReducer {
    items: BTreeMap<(String, String), Resource>,
    primed: bool,
}

fn obj_key(r: &Resource) -> Option<(String, String)> {
    Some((r.namespace().unwrap_or_default().to_string(), r.name()?.to_string()))
}

impl SnapshotReducer {
    pub fn new() -> Self { Self::default() }

    /// Apply one event. Returns `None` for the first delivery, the change otherwise.
    pub fn apply(&mut self, ev: WatchEvent) -> Option<WatchAction> {
        let action = match ev {
            WatchEvent::Restarted(list) => {
                self.items = list.into_iter().filter_map(|r| Some((obj_key(&r)?, r))).collect();
                WatchAction::Resynced
            }
            WatchEvent::Applied(r) => match obj_key(&r) {
                Some(k) => match self.items.insert(k, r) {
                    Some(_) => WatchAction::Modified,
                    None => WatchAction::Added,
                },
                None => WatchAction::Modified,
            },
            WatchEvent::Deleted(r) => {
                if let Some(k) = obj_key(&r) {
                    self.items.remove(&k);
                }
                WatchAction::Deleted
            }
        };
        let first = !self.primed;
        self.primed = true;
        if first { None } else { Some(action) }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Current snapshot indexed by name.
    pub fn snapshot(&self) -> IndexedCollection {
        RawCollection(self.items.values().cloned().collect()).by(NAME_PATH)
    }
}

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

type Callback = Box<dyn FnMut(&IndexedCollection, Option<WatchAction>) + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Callback slot shared by the delivery task and the handle.
///
/// The task invokes the callback only while holding the slot; `detach` empties it
/// under the same lock, so once `detach` returns no invocation is running or can start.
struct Delivery {
    callback: Mutex<Option<Callback>>,
    // Thread currently inside the callback, so a release issued from the callback skips the lock.
    running_on: Mutex<Option<ThreadId>>,
}

impl Delivery {
    fn new(callback: Callback) -> Arc<Self> {
        Arc::new(Self { callback: Mutex::new(Some(callback)), running_on: Mutex::new(None) })
    }

    /// Run the callback. Returns `false` once the subscription is released.
    fn deliver(&self, released: &CancellationToken, snap: &IndexedCollection, action: Option<WatchAction>) -> bool {
        let mut slot = lock(&self.callback);
        if released.is_cancelled() {
            let dropped = slot.take();
            drop(slot);
            drop(dropped);
            return false;
        }
        let Some(cb) = slot.as_mut() else { return false };
        *lock(&self.running_on) = Some(thread::current().id());
        cb(snap, action);
        *lock(&self.running_on) = None;
        true
    }

    fn detach(&self) {
        if *lock(&self.running_on) == Some(thread::current().id()) {
            // Released from inside the callback; the task drops it once the call returns.
            return;
        }
        let dropped = lock(&self.callback).take();
        drop(dropped);
    }
}

/// One active subscription. Owned by the view that opened it.
pub struct SubscriptionHandle {
    id: u64,
    kind: String,
    token: CancellationToken,
    released: AtomicBool,
    finished: Arc<AtomicBool>,
    delivery: Arc<Delivery>,
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("active", &self.is_active())
            .finish()
    }
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 { self.id }
    pub fn kind(&self) -> &str { &self.kind }

    /// True until released or until the underlying stream ends.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && !self.finished.load(Ordering::SeqCst)
    }

    /// Stop deliveries. Returns `false` when the handle was already released.
    ///
    /// If a delivery is running on another thread this waits for it to return.
    /// After `release` returns the callback is never invoked again. Releasing from
    /// inside the callback does not wait.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.token.cancel();
        self.delivery.detach();
        metrics::counter!("console_watch_released_total", 1u64);
        debug!(id = self.id, kind = %self.kind, "subscription released");
        true
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Wraps a `DataService` with snapshot delivery and teardown.
#[derive(Clone)]
pub struct SubscriptionManager {
    svc: Arc<dyn DataService>,
    queue_cap: usize,
}

impl SubscriptionManager {
    pub fn new(svc: Arc<dyn DataService>) -> Self {
        Self::with_capacity(svc, DEFAULT_QUEUE_CAP)
    }

    /// `queue_cap` bounds the events buffered between the transport and the callback.
    /// A full buffer stops reading from the transport until the callback catches up.
    pub fn with_capacity(svc: Arc<dyn DataService>, queue_cap: usize) -> Self {
        Self { svc, queue_cap: queue_cap.max(1) }
    }

    pub fn service(&self) -> Arc<dyn DataService> {
        self.svc.clone()
    }

    pub fn queue_cap(&self) -> usize { self.queue_cap }

    /// One-shot listing indexed by name.
    pub async fn list(&self, kind: &str, ctx: &ViewContext) -> Result<IndexedCollection, FetchError> {
        let raw = self.svc.list(kind, ctx).await.map_err(|e| {
            debug!(kind = %kind, ns = ?ctx.scope(), error = %e, "list failed");
            e
        })?;
        Ok(raw.by(NAME_PATH))
    }

    pub async fn get(&self, kind: &str, name: &str, ctx: &ViewContext) -> Result<Resource, FetchError> {
        self.svc.get(kind, name, ctx).await
    }

    /// Subscribe to `kind` within `ctx`.
    ///
    /// `on_update` runs once with the initial snapshot and `None`, then once per
    /// event with the full rebuilt snapshot and the action, in event order.
    pub async fn watch<F>(&self, kind: &str, ctx: &ViewContext, on_update: F) -> Result<SubscriptionHandle, WatchTransportError>
    where
        F: FnMut(&IndexedCollection, Option<WatchAction>) + Send + 'static,
    {
        let stream = self.svc.watch(kind, ctx).await.map_err(|e| {
            warn!(kind = %kind, ns = ?ctx.scope(), error = %e, "watch failed to establish");
            e
        })?;
        Ok(spawn_delivery(kind, ctx, stream, self.queue_cap, Box::new(on_update)))
    }

    /// Subscribe to a single object. `on_update` receives `None` once the object is gone.
    ///
    /// Deliveries happen on the initial load and whenever the object itself changes.
    pub async fn watch_object<F>(&self, kind: &str, name: &str, ctx: &ViewContext, mut on_update: F) -> Result<SubscriptionHandle, WatchTransportError>
    where
        F: FnMut(Option<&Resource>, Option<WatchAction>) + Send + 'static,
    {
        let name = name.to_string();
        let mut last: Option<Resource> = None;
        self.watch(kind, ctx, move |snap, action| {
            let now = snap.get(&name);
            let Some(action) = action else {
                last = now.cloned();
                on_update(now, None);
                return;
            };
            if now == last.as_ref() {
                return;
            }
            let action = match (last.is_some(), now.is_some()) {
                (true, false) => WatchAction::Deleted,
                (false, true) => WatchAction::Added,
                _ if action == WatchAction::Resynced => WatchAction::Resynced,
                _ => WatchAction::Modified,
            };
            last = now.cloned();
            on_update(now, Some(action));
        })
        .await
    }

    /// Release every handle. Safe on empty sets and already released handles.
    /// Returns how many handles were newly released.
    pub fn release<'a, I>(handles: I) -> usize
    where
        I: IntoIterator<Item = &'a SubscriptionHandle>,
    {
        handles.into_iter().filter(|h| h.release()).count()
    }
}

/// Reads the transport into a bounded queue until released or the stream ends.
fn spawn_pump(mut stream: EventStream, cap: usize, released: CancellationToken) -> mpsc::Receiver<Result<WatchEvent, WatchTransportError>> {
    let (tx, rx) = mpsc::channel(cap);
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = released.cancelled() => break,
                ev = stream.next() => ev,
            };
            let Some(ev) = next else { break };
            if tx.send(ev).await.is_err() {
                break;
            }
        }
    });
    rx
}

fn spawn_delivery(kind: &str, ctx: &ViewContext, stream: EventStream, cap: usize, on_update: Callback) -> SubscriptionHandle {
    let id = NEXT_HANDLE.fetch_add(1, Ordering::Relaxed);
    let token = CancellationToken::new();
    let finished = Arc::new(AtomicBool::new(false));
    let delivery = Delivery::new(on_update);
    let cancelled = token.clone();
    let done = finished.clone();
    let slot = delivery.clone();
    let task_kind = kind.to_string();
    let mut events = spawn_pump(stream, cap, token.clone());
    metrics::counter!("console_watch_started_total", 1u64);
    info!(id, kind = %kind, ns = ?ctx.scope(), "subscription started");

    tokio::spawn(async move {
        let mut reducer = SnapshotReducer::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancelled.cancelled() => break,
                ev = events.recv() => ev,
            };
            match next {
                Some(Ok(ev)) => {
                    let action = reducer.apply(ev);
                    if cancelled.is_cancelled() {
                        break;
                    }
                    let label = action.map_or("INITIAL", |a| a.as_str());
                    metrics::counter!("console_watch_events_total", 1u64, "action" => label);
                    let snap = reducer.snapshot();
                    if !slot.deliver(&cancelled, &snap, action) {
                        break;
                    }
                }
                Some(Err(e)) => {
                    metrics::counter!("console_watch_errors_total", 1u64);
                    warn!(id, kind = %task_kind, error = %e, "watch transport error");
                }
                None => {
                    info!(id, kind = %task_kind, "watch stream ended");
                    break;
                }
            }
        }
        done.store(true, Ordering::SeqCst);
        if cancelled.is_cancelled() {
            slot.detach();
        }
        debug!(id, kind = %task_kind, "subscription task stopped");
    });

    SubscriptionHandle { id, kind: kind.to_string(), token, released: AtomicBool::new(false), finished, delivery }
}
