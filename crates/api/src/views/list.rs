use console_core::{IndexedCollection, ViewContext, WatchTransportError};
use console_store::SubscriptionManager;
use tracing::debug;

use crate::kinds;
use crate::session::ViewSession;
use crate::state::{view_channel, ViewHandle, ViewState};

/// Live list of one resource kind.
pub struct ListView {
    session: ViewSession,
    state: ViewHandle<IndexedCollection>,
}

impl ListView {
    pub async fn activate(mgr: &SubscriptionManager, kind: &str, ctx: &ViewContext) -> Result<Self, WatchTransportError> {
        let (publ, state) = view_channel(ViewState::loading());
        let empty = format!("No {}s to show", kinds::label(kind));
        let session = ViewSession::new();
        let log_kind = kind.to_string();
        let handle = mgr
            .watch(kind, ctx, move |snap, action| {
                publ.update(|s| {
                    s.data = snap.clone();
                    s.loaded = true;
                    s.empty_message = empty.clone();
                });
                debug!(kind = %log_kind, items = snap.len(), action = ?action, "list view updated");
            })
            .await?;
        session.track(handle);
        Ok(Self { session, state })
    }

    pub fn state(&self) -> &ViewHandle<IndexedCollection> {
        &self.state
    }

    pub fn session(&self) -> &ViewSession {
        &self.session
    }

    pub fn teardown(&self) -> usize {
        self.session.teardown()
    }
}
