use bevy_ecs::prelude::Resource;

mod physics;
pub mod profiler;
mod transform;
mod types;
mod world;

pub use physics::{sys_integrate_bodies, PhysicsParams};
pub use profiler::{SystemProfiler, SystemTimingSummary, TickKind};
pub use transform::{
    attach_child, children_of, descendants, despawn_recursive, detach_child, is_active, is_active_in_hierarchy,
    parent_of, set_active, set_world_matrix, world_matrix,
};
pub use types::*;
pub use world::PortalWorld;

#[derive(Resource, Clone, Copy, Default)]
pub struct TimeDelta(pub f32);
