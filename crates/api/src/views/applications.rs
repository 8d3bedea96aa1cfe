use std::collections::BTreeMap;
use std::sync::Arc;

use console_core::{IndexedCollection, ViewContext, WatchTransportError};
use console_join::routes_by_app;
use console_store::SubscriptionManager;
use serde::Serialize;
use tracing::debug;

use crate::kinds::{APPLICATIONS, ROUTES};
use crate::session::ViewSession;
use crate::state::{view_channel, AlertQueue, ViewHandle, ViewState};

#[derive(Debug, Clone, Default, Serialize)]
pub struct ApplicationsState {
    pub apps: IndexedCollection,
    pub routes: IndexedCollection,
    /// Routes targeting each application, keyed by application name.
    pub routes_by_app: BTreeMap<String, IndexedCollection>,
    pub routes_loaded: bool,
    pub routes_empty_message: String,
}

/// Applications in a project together with the routes pointing at them.
pub struct ApplicationsView {
    session: ViewSession,
    state: ViewHandle<ApplicationsState>,
}

impl ApplicationsView {
    /// Open both subscriptions. Alerts pending in `queue` are moved into the view.
    pub async fn activate(mgr: &SubscriptionManager, ctx: &ViewContext, queue: Option<&AlertQueue>) -> Result<Self, WatchTransportError> {
        let mut initial = ViewState::<ApplicationsState>::loading();
        initial.data.routes_empty_message = "Loading...".to_string();
        if let Some(q) = queue {
            initial.alerts.extend(q.drain());
        }
        let (publ, state) = view_channel(initial);
        let publ = Arc::new(publ);
        let session = ViewSession::new();

        let apps_publ = Arc::clone(&publ);
        let apps = mgr
            .watch(APPLICATIONS, ctx, move |snap, action| {
                apps_publ.update(|s| {
                    s.data.apps = snap.clone();
                    s.loaded = true;
                    s.empty_message = "No applications to show".to_string();
                });
                debug!(items = snap.len(), action = ?action, "applications (subscribe)");
            })
            .await?;
        session.track(apps);

        let routes = mgr
            .watch(ROUTES, ctx, move |snap, _| {
                let grouped = routes_by_app(snap);
                publ.update(|s| {
                    s.data.routes = snap.clone();
                    s.data.routes_by_app = grouped;
                    s.data.routes_loaded = true;
                    s.data.routes_empty_message = "No routes to show".to_string();
                });
            })
            .await?;
        session.track(routes);

        Ok(Self { session, state })
    }

    pub fn state(&self) -> &ViewHandle<ApplicationsState> {
        &self.state
    }

    pub fn teardown(&self) -> usize {
        self.session.teardown()
    }
}
