//! Console view-model API.
//!
//! Each view owns an explicit state object ([`ViewHandle`]) fed by its
//! subscriptions and a [`ViewSession`] that releases those subscriptions exactly
//! once when the view goes away. Frontends (CLI today) depend on this crate only.

#![forbid(unsafe_code)]

pub mod session;
pub mod state;
pub mod views;

pub use console_core::{ConsoleConfig, FetchError, IndexedCollection, Resource, ViewContext, WatchAction, WatchTransportError};
pub use console_store::{MemoryDataService, SubscriptionHandle, SubscriptionManager};
pub use session::ViewSession;
pub use state::{view_channel, Alert, AlertKind, AlertQueue, ViewHandle, ViewPublisher, ViewState};
pub use views::{ApplicationsState, ApplicationsView, Detail, DetailView, InstancesView, ListView};

/// Plural resource kinds the console works with.
pub mod kinds {
    pub const APPLICATIONS: &str = "applications";
    pub const BACKING_SERVICES: &str = "backingservices";
    pub const BACKING_SERVICE_INSTANCES: &str = "backingserviceinstances";
    pub const ROUTES: &str = "routes";

    /// Human label used in alert messages.
    pub fn label(kind: &str) -> &str {
        match kind {
            APPLICATIONS => "application",
            BACKING_SERVICES => "backing service",
            BACKING_SERVICE_INSTANCES => "backing service instance",
            ROUTES => "route",
            other => other,
        }
    }
}
