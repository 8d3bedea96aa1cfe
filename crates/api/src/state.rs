//! Published per-view state: one writer, many readers, epoch notifications.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertKind {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Alert {
    pub fn error(message: impl Into<String>) -> Self {
        Self { kind: AlertKind::Error, message: message.into(), details: None }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self { kind: AlertKind::Warning, message: message.into(), details: None }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Alerts raised before a view exists (e.g. by a create flow), handed to the next view.
#[derive(Debug, Default)]
pub struct AlertQueue {
    pending: Mutex<Vec<(String, Alert)>>,
}

impl AlertQueue {
    pub fn new() -> Self { Self::default() }

    pub fn push(&self, name: impl Into<String>, alert: Alert) {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).push((name.into(), alert));
    }

    /// Take every pending alert, leaving the queue empty.
    pub fn drain(&self) -> Vec<(String, Alert)> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// What a view renders from.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ViewState<T> {
    pub epoch: u64,
    pub data: T,
    pub alerts: BTreeMap<String, Alert>,
    /// Set once the first load finished, successfully or not.
    pub loaded: bool,
    pub empty_message: String,
}

impl<T: Default> ViewState<T> {
    pub fn loading() -> Self {
        Self { empty_message: "Loading...".to_string(), ..Self::default() }
    }
}

/// Write side of a view's state. Updates are serialized.
pub struct ViewPublisher<T> {
    snap: Arc<ArcSwap<ViewState<T>>>,
    epoch_tx: watch::Sender<u64>,
    write: Mutex<()>,
}

impl<T: Clone> ViewPublisher<T> {
    /// Apply `f` to a copy of the current state and publish it under the next epoch.
    pub fn update<F>(&self, f: F) -> u64
    where
        F: FnOnce(&mut ViewState<T>),
    {
        let _guard = self.write.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.snap.load_full();
        let mut next: ViewState<T> = (*current).clone();
        f(&mut next);
        next.epoch = next.epoch.saturating_add(1);
        let epoch = next.epoch;
        self.snap.store(Arc::new(next));
        let _ = self.epoch_tx.send(epoch);
        epoch
    }

    pub fn current(&self) -> Arc<ViewState<T>> {
        self.snap.load_full()
    }
}

/// Read side of a view's state.
pub struct ViewHandle<T> {
    snap: Arc<ArcSwap<ViewState<T>>>,
    epoch_rx: watch::Receiver<u64>,
}

impl<T> Clone for ViewHandle<T> {
    fn clone(&self) -> Self {
        Self { snap: Arc::clone(&self.snap), epoch_rx: self.epoch_rx.clone() }
    }
}

impl<T> ViewHandle<T> {
    pub fn current(&self) -> Arc<ViewState<T>> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_rx.clone() }

    /// Wait until `pred` holds for the published state. Returns the last state
    /// if the publisher goes away first.
    pub async fn wait_until<P>(&self, mut pred: P) -> Arc<ViewState<T>>
    where
        P: FnMut(&ViewState<T>) -> bool,
    {
        let mut rx = self.epoch_rx.clone();
        loop {
            let cur = self.current();
            if pred(&cur) {
                return cur;
            }
            if rx.changed().await.is_err() {
                return self.current();
            }
        }
    }
}

pub fn view_channel<T>(initial: ViewState<T>) -> (ViewPublisher<T>, ViewHandle<T>) {
    let epoch = initial.epoch;
    let snap = Arc::new(ArcSwap::from_pointee(initial));
    let (epoch_tx, epoch_rx) = watch::channel(epoch);
    (
        ViewPublisher { snap: Arc::clone(&snap), epoch_tx, write: Mutex::new(()) },
        ViewHandle { snap, epoch_rx },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_bumps_epoch_and_notifies() {
        let (publ, handle) = view_channel(ViewState::<Vec<u32>>::loading());
        let mut rx = handle.subscribe_epoch();
        assert_eq!(publ.update(|s| s.data.push(1)), 1);
        assert_eq!(publ.update(|s| s.data.push(2)), 2);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 2);
        assert_eq!(handle.current().data, vec![1, 2]);
        assert_eq!(handle.current().empty_message, "Loading...");
    }

    #[test]
    fn alert_queue_drains_once() {
        let q = AlertQueue::new();
        q.push("created", Alert::warning("Instance created"));
        assert_eq!(q.drain().len(), 1);
        assert!(q.drain().is_empty());
    }

    #[tokio::test]
    async fn wait_until_sees_later_updates() {
        let (publ, handle) = view_channel(ViewState::<u32>::default());
        let waiter = tokio::spawn({
            let handle = handle.clone();
            async move { handle.wait_until(|s| s.data >= 3).await.data }
        });
        for _ in 0..3 {
            publ.update(|s| s.data += 1);
        }
        assert_eq!(waiter.await.unwrap(), 3);
    }
}
