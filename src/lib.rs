pub mod clipping;
pub mod cloning;
pub mod config;
pub mod ecs;
pub mod events;
pub mod portal;

pub use ecs::PortalWorld;
