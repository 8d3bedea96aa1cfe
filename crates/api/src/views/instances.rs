use std::sync::Arc;

use console_core::{IndexedCollection, ViewContext, WatchTransportError};
use console_join::enrich;
use console_store::SubscriptionManager;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::kinds::{BACKING_SERVICES, BACKING_SERVICE_INSTANCES};
use crate::session::ViewSession;
use crate::state::{view_channel, Alert, ViewHandle, ViewState};

const CATALOG_ALERT: &str = "catalog";

/// Live backing service instances, each labelled with the backing service owning its plan.
///
/// Every primary snapshot is enriched against a freshly listed catalog. Snapshots
/// superseded while the catalog fetch is in flight are skipped.
pub struct InstancesView {
    session: ViewSession,
    state: ViewHandle<IndexedCollection>,
}

impl InstancesView {
    pub async fn activate(mgr: &SubscriptionManager, ctx: &ViewContext, catalog_ns: &str) -> Result<Self, WatchTransportError> {
        let (publ, state) = view_channel(ViewState::loading());
        let publ = Arc::new(publ);
        let session = ViewSession::new();

        let (snap_tx, mut snap_rx) = watch::channel::<Option<IndexedCollection>>(None);
        let handle = mgr
            .watch(BACKING_SERVICE_INSTANCES, ctx, move |snap, _| {
                let _ = snap_tx.send(Some(snap.clone()));
            })
            .await?;
        session.track(handle);

        let token = session.token();
        let mgr = mgr.clone();
        let catalog = ViewContext::namespace(catalog_ns);
        info!(ns = ?ctx.scope(), catalog = %catalog_ns, "instances view activated");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    changed = snap_rx.changed() => {
                        if changed.is_err() { break; }
                    }
                }
                let latest = snap_rx.borrow_and_update().clone();
                let Some(mut primary) = latest else { continue };
                let reference = mgr.list(BACKING_SERVICES, &catalog).await;
                if token.is_cancelled() {
                    break;
                }
                if snap_rx.has_changed().unwrap_or(false) {
                    debug!("instances snapshot superseded during catalog fetch");
                    continue;
                }
                match reference {
                    Ok(reference) => {
                        let matched = enrich(&mut primary, &reference);
                        debug!(instances = primary.len(), matched, "instances enriched");
                        publ.update(|s| {
                            s.data = primary;
                            s.alerts.remove(CATALOG_ALERT);
                            s.loaded = true;
                            s.empty_message = "No instances to show".to_string();
                        });
                    }
                    Err(e) => {
                        publ.update(|s| {
                            s.data = primary;
                            s.alerts.insert(
                                CATALOG_ALERT.to_string(),
                                Alert::warning("Backing services could not be loaded.").with_details(format!("Reason: {e}")),
                            );
                            s.loaded = true;
                            s.empty_message = "No instances to show".to_string();
                        });
                    }
                }
            }
            debug!("instances worker stopped");
        });

        Ok(Self { session, state })
    }

    pub fn state(&self) -> &ViewHandle<IndexedCollection> {
        &self.state
    }

    pub fn teardown(&self) -> usize {
        self.session.teardown()
    }
}
