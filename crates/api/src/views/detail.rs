use std::sync::Arc;

use console_core::{Resource, ViewContext, WatchAction};
use console_join::routes_for_app;
use console_store::SubscriptionManager;
use serde::Serialize;
use tracing::{debug, warn};

use crate::kinds::{self, ROUTES};
use crate::session::ViewSession;
use crate::state::{view_channel, Alert, ViewHandle, ViewState};

#[derive(Debug, Clone, Default, Serialize)]
pub struct Detail {
    pub resource: Option<Resource>,
    /// Routes pointing at the resource; only filled for applications.
    pub routes: Vec<Resource>,
    pub deleted: bool,
}

/// One named resource, kept live after the initial fetch.
pub struct DetailView {
    session: ViewSession,
    state: ViewHandle<Detail>,
}

impl DetailView {
    /// Failures never abort activation; they end up as `load`/`watch` alerts.
    pub async fn activate(mgr: &SubscriptionManager, kind: &str, name: &str, ctx: &ViewContext) -> Self {
        Self::open(mgr, kind, name, ctx, false).await
    }

    /// Application detail: the application plus the routes targeting it.
    pub async fn application(mgr: &SubscriptionManager, name: &str, ctx: &ViewContext) -> Self {
        Self::open(mgr, kinds::APPLICATIONS, name, ctx, true).await
    }

    async fn open(mgr: &SubscriptionManager, kind: &str, name: &str, ctx: &ViewContext, with_routes: bool) -> Self {
        let (publ, state) = view_channel(ViewState::<Detail>::default());
        let publ = Arc::new(publ);
        let session = ViewSession::new();
        let label = kinds::label(kind).to_string();

        match mgr.get(kind, name, ctx).await {
            Ok(res) => {
                publ.update(|s| {
                    s.loaded = true;
                    s.data.resource = Some(res);
                });
                let obj_publ = Arc::clone(&publ);
                let deleted_msg = format!("This {label} has been deleted.");
                let watched = mgr
                    .watch_object(kind, name, ctx, move |res, action| {
                        obj_publ.update(|s| {
                            if let Some(r) = res {
                                s.data.resource = Some(r.clone());
                            }
                            match action {
                                // Gone before the first delivery: the fetched copy is already stale.
                                None if res.is_none() => {
                                    s.data.deleted = true;
                                    s.alerts.insert("deleted".to_string(), Alert::warning(deleted_msg.clone()));
                                }
                                Some(WatchAction::Deleted) => {
                                    s.data.deleted = true;
                                    s.alerts.insert("deleted".to_string(), Alert::warning(deleted_msg.clone()));
                                }
                                Some(WatchAction::Added) => {
                                    s.data.deleted = false;
                                    s.alerts.remove("deleted");
                                }
                                _ => {}
                            }
                        });
                    })
                    .await;
                match watched {
                    Ok(h) => session.track(h),
                    Err(e) => {
                        warn!(kind = %kind, name = %name, error = %e, "detail watch failed");
                        publ.update(|s| {
                            s.alerts.insert(
                                "watch".to_string(),
                                Alert::warning(format!("Live updates for this {label} are unavailable.")).with_details(format!("Reason: {e}")),
                            );
                        });
                    }
                }
            }
            Err(e) => {
                debug!(kind = %kind, name = %name, error = %e, "detail load failed");
                publ.update(|s| {
                    s.loaded = true;
                    s.alerts.insert(
                        "load".to_string(),
                        Alert::error(format!("The {label} details could not be loaded.")).with_details(format!("Reason: {e}")),
                    );
                });
            }
        }

        if with_routes {
            let app = name.to_string();
            let routes_publ = Arc::clone(&publ);
            match mgr
                .watch(ROUTES, ctx, move |snap, _| {
                    let routes: Vec<Resource> = routes_for_app(snap, &app).into_iter().cloned().collect();
                    routes_publ.update(|s| s.data.routes = routes);
                })
                .await
            {
                Ok(h) => session.track(h),
                Err(e) => warn!(name = %name, error = %e, "routes watch failed"),
            }
        }

        Self { session, state }
    }

    pub fn state(&self) -> &ViewHandle<Detail> {
        &self.state
    }

    pub fn teardown(&self) -> usize {
        self.session.teardown()
    }
}
