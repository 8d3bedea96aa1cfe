#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use console_core::prelude::*;
use console_store::{MemoryDataService, SubscriptionManager};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

type Delivery = (Vec<String>, Option<WatchAction>);

fn obj(ns: &str, name: &str) -> Resource {
    Resource::new(json!({ "metadata": { "name": name, "namespace": ns }, "spec": {} }))
}

fn setup() -> (Arc<MemoryDataService>, SubscriptionManager) {
    let svc = Arc::new(MemoryDataService::new());
    let mgr = SubscriptionManager::new(svc.clone());
    (svc, mgr)
}

async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    timeout(Duration::from_secs(2), rx.recv()).await.expect("delivery timed out").expect("callback dropped")
}

async fn watch_keys(mgr: &SubscriptionManager, kind: &str, ctx: &ViewContext) -> (console_store::SubscriptionHandle, mpsc::UnboundedReceiver<Delivery>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let h = mgr
        .watch(kind, ctx, move |snap, action| {
            let _ = tx.send((snap.keys().map(str::to_string).collect(), action));
        })
        .await
        .unwrap();
    (h, rx)
}

#[tokio::test]
async fn events_are_delivered_in_order_and_stop_after_release() {
    let (svc, mgr) = setup();
    let ctx = ViewContext::project("p");
    let (h, mut rx) = watch_keys(&mgr, "applications", &ctx).await;

    assert_eq!(next(&mut rx).await, (vec![], None));
    svc.apply("applications", obj("p", "e1"));
    assert_eq!(next(&mut rx).await, (vec!["e1".to_string()], Some(WatchAction::Added)));
    svc.apply("applications", obj("p", "e2"));
    assert_eq!(next(&mut rx).await, (vec!["e1".to_string(), "e2".to_string()], Some(WatchAction::Added)));

    assert_eq!(SubscriptionManager::release([&h]), 1);
    svc.apply("applications", obj("p", "e3"));
    let after = timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(matches!(after, Ok(None) | Err(_)), "delivery after release: {after:?}");

    // releasing again is a no-op
    assert_eq!(SubscriptionManager::release([&h]), 0);
    assert!(!h.is_active());
}

#[tokio::test]
async fn each_update_carries_the_full_rebuilt_snapshot() {
    let (svc, mgr) = setup();
    svc.apply("backingserviceinstances", obj("p", "inst1"));
    svc.apply("backingserviceinstances", obj("p", "inst2"));
    let (_h, mut rx) = watch_keys(&mgr, "backingserviceinstances", &ViewContext::project("p")).await;

    let (keys, action) = next(&mut rx).await;
    assert_eq!(keys.len(), 2);
    assert_eq!(action, None);

    svc.delete("backingserviceinstances", "p", "inst1");
    assert_eq!(next(&mut rx).await, (vec!["inst2".to_string()], Some(WatchAction::Deleted)));
}

#[tokio::test]
async fn watch_is_scoped_to_context() {
    let (svc, mgr) = setup();
    let (_h, mut rx) = watch_keys(&mgr, "routes", &ViewContext::project("p")).await;
    assert_eq!(next(&mut rx).await, (vec![], None));
    svc.apply("routes", obj("elsewhere", "r0"));
    svc.apply("routes", obj("p", "r1"));
    assert_eq!(next(&mut rx).await, (vec!["r1".to_string()], Some(WatchAction::Added)));
}

#[tokio::test]
async fn relist_is_reported_as_resync() {
    let (svc, mgr) = setup();
    svc.apply("routes", obj("p", "r1"));
    let (_h, mut rx) = watch_keys(&mgr, "routes", &ViewContext::project("p")).await;
    next(&mut rx).await;
    svc.relist("routes", "p", vec![obj("p", "r2"), obj("p", "r3")]);
    assert_eq!(next(&mut rx).await, (vec!["r2".to_string(), "r3".to_string()], Some(WatchAction::Resynced)));
}

#[tokio::test]
async fn transport_errors_do_not_end_the_subscription() {
    let (svc, mgr) = setup();
    let (h, mut rx) = watch_keys(&mgr, "routes", &ViewContext::project("p")).await;
    next(&mut rx).await;
    svc.interrupt("routes", "connection reset");
    svc.apply("routes", obj("p", "r1"));
    assert_eq!(next(&mut rx).await, (vec!["r1".to_string()], Some(WatchAction::Added)));
    assert!(h.is_active());

    svc.close_watches("routes");
    let end = timeout(Duration::from_secs(2), rx.recv()).await;
    assert!(matches!(end, Ok(None)));
    assert!(!h.is_active());
}

#[tokio::test]
async fn establish_failure_is_returned() {
    let (svc, mgr) = setup();
    svc.fail_watches("routes", Some(WatchTransportError::Establish("forbidden".into())));
    let res = mgr.watch("routes", &ViewContext::project("p"), |_, _| {}).await;
    assert!(matches!(res, Err(WatchTransportError::Establish(_))));
}

#[tokio::test]
async fn list_failure_surfaces_once() {
    let (svc, mgr) = setup();
    svc.fail_lists("backingservices", Some(FetchError::Forbidden("no".into())));
    let err = mgr.list("backingservices", &ViewContext::namespace("openshift")).await.unwrap_err();
    assert_eq!(err, FetchError::Forbidden("no".into()));
    assert_eq!(svc.list_calls(), 1);
}

#[tokio::test]
async fn released_handle_closes_the_transport_stream() {
    let (svc, mgr) = setup();
    let (h, mut rx) = watch_keys(&mgr, "routes", &ViewContext::project("p")).await;
    next(&mut rx).await;
    assert_eq!(svc.watcher_count("routes"), 1);
    drop(h);
    let mut open = 1;
    for _ in 0..50 {
        open = svc.watcher_count("routes");
        if open == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(open, 0);
}

#[tokio::test]
async fn watch_object_tracks_one_resource() {
    let (svc, mgr) = setup();
    svc.apply("applications", obj("p", "web"));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let _h = mgr
        .watch_object("applications", "web", &ViewContext::project("p"), move |res, action| {
            let _ = tx.send((res.and_then(|r| r.name().map(str::to_string)), action));
        })
        .await
        .unwrap();

    assert_eq!(next(&mut rx).await, (Some("web".to_string()), None));
    // unrelated objects do not trigger a delivery
    svc.apply("applications", obj("p", "db"));
    let mut updated = obj("p", "web");
    updated.raw["spec"] = json!({ "replicas": 2 });
    svc.apply("applications", updated);
    assert_eq!(next(&mut rx).await, (Some("web".to_string()), Some(WatchAction::Modified)));
    svc.delete("applications", "p", "web");
    assert_eq!(next(&mut rx).await, (None, Some(WatchAction::Deleted)));
}

#[tokio::test]
async fn a_one_slot_queue_still_delivers_every_event_in_order() {
    let svc = Arc::new(MemoryDataService::new());
    let mgr = SubscriptionManager::with_capacity(svc.clone(), 1);
    assert_eq!(mgr.queue_cap(), 1);
    let ctx = ViewContext::project("p");
    let (_h, mut rx) = watch_keys(&mgr, "routes", &ctx).await;

    for i in 0..20 {
        svc.apply("routes", obj("p", &format!("r{i:02}")));
    }
    assert_eq!(next(&mut rx).await, (vec![], None));
    for i in 0..20 {
        let (keys, action) = next(&mut rx).await;
        assert_eq!(keys.len(), i + 1);
        assert_eq!(keys.last().map(String::as_str), Some(format!("r{i:02}").as_str()));
        assert_eq!(action, Some(WatchAction::Added));
    }
}

#[test]
fn zero_capacity_is_raised_to_one() {
    let mgr = SubscriptionManager::with_capacity(Arc::new(MemoryDataService::new()), 0);
    assert_eq!(mgr.queue_cap(), 1);
}
