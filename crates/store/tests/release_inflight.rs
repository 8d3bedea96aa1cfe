#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use console_core::prelude::*;
use console_store::{MemoryDataService, SubscriptionHandle, SubscriptionManager};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn route(name: &str) -> Resource {
    Resource::new(json!({
        "metadata": { "name": name, "namespace": "p" },
        "spec": { "to": { "kind": "Service", "name": format!("svc-{name}") } },
    }))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_waits_for_a_running_delivery() {
    let svc = Arc::new(MemoryDataService::new());
    let mgr = SubscriptionManager::new(svc.clone());
    let ctx = ViewContext::project("p");

    let (entered_tx, mut entered) = mpsc::unbounded_channel();
    let finished = Arc::new(AtomicBool::new(false));
    let released = Arc::new(AtomicBool::new(false));
    let late = Arc::new(AtomicUsize::new(0));
    let (f, r, l) = (finished.clone(), released.clone(), late.clone());
    let h = mgr
        .watch("routes", &ctx, move |_, action| {
            if r.load(Ordering::SeqCst) {
                l.fetch_add(1, Ordering::SeqCst);
            }
            if action.is_some() {
                let _ = entered_tx.send(());
                std::thread::sleep(Duration::from_millis(150));
                f.store(true, Ordering::SeqCst);
            }
        })
        .await
        .unwrap();

    svc.apply("routes", route("r1"));
    timeout(Duration::from_secs(2), entered.recv()).await.unwrap().unwrap();
    assert_eq!(SubscriptionManager::release([&h]), 1);
    assert!(finished.load(Ordering::SeqCst), "release returned while the callback was still running");
    released.store(true, Ordering::SeqCst);

    svc.apply("routes", route("r2"));
    sleep(Duration::from_millis(200)).await;
    assert_eq!(late.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_during_a_large_snapshot_build_suppresses_the_callback() {
    let svc = Arc::new(MemoryDataService::new());
    for i in 0..20_000 {
        svc.apply("routes", route(&format!("r{i:05}")));
    }
    let mgr = SubscriptionManager::new(svc.clone());
    let ctx = ViewContext::project("p");

    for (round, delay_us) in [0u64, 200, 1_000, 5_000, 20_000].into_iter().enumerate() {
        let (init_tx, mut init) = mpsc::unbounded_channel();
        let released = Arc::new(AtomicBool::new(false));
        let late = Arc::new(AtomicUsize::new(0));
        let (r, l) = (released.clone(), late.clone());
        let h = mgr
            .watch("routes", &ctx, move |_, action| {
                if r.load(Ordering::SeqCst) {
                    l.fetch_add(1, Ordering::SeqCst);
                }
                if action.is_none() {
                    let _ = init_tx.send(());
                }
            })
            .await
            .unwrap();
        timeout(Duration::from_secs(10), init.recv()).await.unwrap().unwrap();

        svc.apply("routes", route(&format!("extra{round}")));
        sleep(Duration::from_micros(delay_us)).await;
        SubscriptionManager::release([&h]);
        released.store(true, Ordering::SeqCst);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(late.load(Ordering::SeqCst), 0, "callback ran after release (delay {delay_us}us)");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn release_from_inside_the_callback_returns() {
    let svc = Arc::new(MemoryDataService::new());
    let mgr = SubscriptionManager::new(svc.clone());
    let ctx = ViewContext::project("p");

    let cell: Arc<OnceLock<SubscriptionHandle>> = Arc::new(OnceLock::new());
    let own = cell.clone();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let h = mgr
        .watch("routes", &ctx, move |snap, action| {
            let released = action.and_then(|_| own.get()).map(|h| h.release());
            let _ = tx.send((snap.len(), released));
        })
        .await
        .unwrap();
    assert!(cell.set(h).is_ok());

    let first = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(first, Some((0, None)));

    svc.apply("routes", route("r1"));
    let second = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(second, Some((1, Some(true))));

    svc.apply("routes", route("r2"));
    let after = timeout(Duration::from_millis(300), rx.recv()).await;
    assert!(matches!(after, Ok(None) | Err(_)), "delivery after in-callback release: {after:?}");
    assert!(!cell.get().unwrap().is_active());
}
