//! Portal capability and portal chains.
//!
//! The engine never inspects portal internals. A portal is anything implementing
//! [`PortalSpace`]; a [`PortalChain`] applies a sequence of portals in order, so a chain
//! `[p1, p2]` maps a pose `x` to `p2(p1(x))`.

use crate::ecs::world_matrix;
use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Spatial remapping exposed by a portal.
pub trait PortalSpace: Send + Sync {
    fn modify_matrix(&self, matrix: &mut Mat4);
    fn modify_point(&self, point: &mut Vec3);
    fn modify_vector(&self, vector: &mut Vec3);
    fn modify_layer(&self, layer: u32) -> u32;
    fn modify_tag(&self, tag: &mut String);
}

/// A rigid transform with optional layer and tag remapping.
#[derive(Clone, Debug, PartialEq)]
pub struct RigidPortal {
    pub transform: Mat4,
    pub layer_remap: HashMap<u32, u32>,
    pub tag_remap: HashMap<String, String>,
}

impl RigidPortal {
    pub fn new(transform: Mat4) -> Self {
        Self { transform, layer_remap: HashMap::new(), tag_remap: HashMap::new() }
    }

    pub fn identity() -> Self {
        Self::new(Mat4::IDENTITY)
    }

    /// Rotation about `axis` through `pivot`, followed by nothing else.
    pub fn rotation_about(pivot: Vec3, axis: Vec3, angle: f32) -> Self {
        let rotation = Mat4::from_quat(Quat::from_axis_angle(axis.normalize(), angle));
        Self::new(Mat4::from_translation(pivot) * rotation * Mat4::from_translation(-pivot))
    }

    /// Maps the local frame of `from` onto the local frame of `to`, flipped half a turn
    /// about up so that entering `from` means leaving `to` through its front face.
    pub fn between(from: Mat4, to: Mat4) -> Self {
        let flip = Mat4::from_rotation_y(std::f32::consts::PI);
        Self::new(to * flip * from.inverse())
    }

    pub fn with_layer(mut self, from: u32, to: u32) -> Self {
        self.layer_remap.insert(from, to);
        self
    }

    pub fn with_tag(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.tag_remap.insert(from.into(), to.into());
        self
    }

    pub fn inverse(&self) -> Self {
        Self {
            transform: self.transform.inverse(),
            layer_remap: self.layer_remap.iter().map(|(&from, &to)| (to, from)).collect(),
            tag_remap: self.tag_remap.iter().map(|(from, to)| (to.clone(), from.clone())).collect(),
        }
    }
}

impl PortalSpace for RigidPortal {
    fn modify_matrix(&self, matrix: &mut Mat4) {
        *matrix = self.transform * *matrix;
    }

    fn modify_point(&self, point: &mut Vec3) {
        *point = self.transform.transform_point3(*point);
    }

    fn modify_vector(&self, vector: &mut Vec3) {
        *vector = self.transform.transform_vector3(*vector);
    }

    fn modify_layer(&self, layer: u32) -> u32 {
        self.layer_remap.get(&layer).copied().unwrap_or(layer)
    }

    fn modify_tag(&self, tag: &mut String) {
        if let Some(mapped) = self.tag_remap.get(tag.as_str()) {
            tag.clone_from(mapped);
        }
    }
}

#[derive(Component, Clone)]
pub struct Portal {
    pub space: Arc<dyn PortalSpace>,
    pub connected: Option<Entity>,
}

impl Portal {
    pub fn new(space: impl PortalSpace + 'static) -> Self {
        Self { space: Arc::new(space), connected: None }
    }

    pub fn with_connected(mut self, connected: Entity) -> Self {
        self.connected = Some(connected);
        self
    }
}

impl fmt::Debug for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Portal").field("connected", &self.connected).finish_non_exhaustive()
    }
}

/// Ordered portals crossed from an original to one of its clones.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct PortalChain(SmallVec<[Entity; 4]>);

impl PortalChain {
    pub fn empty() -> Self {
        Self(SmallVec::new())
    }

    pub fn single(portal: Entity) -> Self {
        let mut chain = Self::empty();
        chain.push(portal);
        chain
    }

    pub fn from_portals(portals: impl IntoIterator<Item = Entity>) -> Self {
        Self(portals.into_iter().collect())
    }

    pub fn push(&mut self, portal: Entity) {
        self.0.push(portal);
    }

    /// `self` followed by `next`.
    pub fn then(&self, next: &PortalChain) -> Self {
        let mut chain = self.clone();
        chain.0.extend(next.0.iter().copied());
        chain
    }

    pub fn portals(&self) -> &[Entity] {
        &self.0
    }

    pub fn last(&self) -> Option<Entity> {
        self.0.last().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn spaces<'w>(&'w self, world: &'w World) -> impl Iterator<Item = &'w dyn PortalSpace> + 'w {
        self.0.iter().filter_map(move |&portal| world.get::<Portal>(portal)).map(|portal| &*portal.space)
    }

    pub fn apply_matrix(&self, world: &World, matrix: Mat4) -> Mat4 {
        let mut out = matrix;
        for space in self.spaces(world) {
            space.modify_matrix(&mut out);
        }
        out
    }

    pub fn apply_point(&self, world: &World, point: Vec3) -> Vec3 {
        let mut out = point;
        for space in self.spaces(world) {
            space.modify_point(&mut out);
        }
        out
    }

    pub fn apply_vector(&self, world: &World, vector: Vec3) -> Vec3 {
        let mut out = vector;
        for space in self.spaces(world) {
            space.modify_vector(&mut out);
        }
        out
    }

    pub fn apply_layer(&self, world: &World, layer: u32) -> u32 {
        self.spaces(world).fold(layer, |layer, space| space.modify_layer(layer))
    }

    pub fn apply_tag(&self, world: &World, tag: &str) -> String {
        let mut out = tag.to_string();
        for space in self.spaces(world) {
            space.modify_tag(&mut out);
        }
        out
    }
}

impl fmt::Display for PortalChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, portal) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, " -> ")?;
            }
            write!(f, "{}", portal.index())?;
        }
        write!(f, "]")
    }
}

/// Surface plane of a portal entity: its world origin and +Z axis.
pub fn portal_plane(world: &World, portal: Entity) -> Option<(Vec3, Vec3)> {
    let matrix = world_matrix(world, portal)?;
    let normal = matrix.transform_vector3(Vec3::Z).normalize_or_zero();
    if normal == Vec3::ZERO {
        return None;
    }
    Some((matrix.transform_point3(Vec3::ZERO), normal))
}
