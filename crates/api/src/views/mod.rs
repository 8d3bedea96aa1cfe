//! Consolidated views. One generic list view covers plain resource lists; the
//! others add the joins and alerts specific to their pages.

mod applications;
mod detail;
mod instances;
mod list;

pub use applications::{ApplicationsState, ApplicationsView};
pub use detail::{Detail, DetailView};
pub use instances::InstancesView;
pub use list::ListView;
