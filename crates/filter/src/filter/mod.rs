//! USB root hub filter
//!
//! Everything that runs on behalf of one filter device: tracking of child
//! devices, redirector creation, and the reconciliation of bus-relations
//! requests against the tracked state.

pub mod child;
pub mod device;
pub mod engine;
pub mod redirector;
pub mod registry;
pub mod relations;
pub mod work_item;

pub use child::{ChildDevice, IdentityError, IdentityRecord, RedirectionState, RedirectorHandle};
pub use device::{FilterDevice, should_attach};
pub use engine::{ChildSummary, ReconciliationEngine};
pub use redirector::{RedirectorFactory, RedirectorPdo};
pub use registry::{ChildRegistry, RedirectionPolicy};
pub use relations::{RelationsBuilder, RelationsView};
pub use work_item::{WorkItem, WorkQueue};
