//! Clone replication: registry, hierarchy replication, per-facet synchronizers and the
//! lifecycle drivers that decide which clones exist.

pub mod driver;
pub mod facet;
pub mod handler;
pub mod hierarchy;
pub mod occupancy;
pub mod registry;
pub mod static_driver;
pub mod sync;

pub use driver::{
    CloneDriver, CloneDriverState, CloneMetrics, DriverSettings, PhysicsCloneDriver, RenderCloneDriver,
};
pub use facet::{FacetFilter, FacetKind, FacetKinds, FacetRef};
pub use handler::{CloneHandler, HandlerArena, HandlerId, HandlerOwner};
pub use hierarchy::{replicate, replicate_bare, replicate_into_template, ClonePair, CloneSet, CloneTemplate};
pub use occupancy::{TriggerContact, TriggerContacts, TriggerKey, TriggerOccupancy, TriggerPhase};
pub use registry::{CloneLink, CloneRegistry};
pub use static_driver::{RecomputeMode, StaticCloneDriver, StaticSlice};
pub use sync::{sync_clone_set, PoseMode};
