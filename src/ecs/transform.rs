use super::{Active, Children, Parent, Transform3D};
use bevy_ecs::prelude::*;
use glam::Mat4;
use smallvec::SmallVec;
use std::collections::HashSet;

/// Upper bound on parent hops; anything deeper is treated as a cycle.
const MAX_HIERARCHY_DEPTH: usize = 256;

/// Composes the world pose of `entity` from the local poses along its parent chain.
pub fn world_matrix(world: &World, entity: Entity) -> Option<Mat4> {
    world.get_entity(entity).ok()?;
    let mut matrix = local_matrix(world, entity);
    let mut current = entity;
    for _ in 0..MAX_HIERARCHY_DEPTH {
        let Some(parent) = world.get::<Parent>(current).map(|p| p.0) else {
            return Some(matrix);
        };
        if world.get_entity(parent).is_err() {
            return Some(matrix);
        }
        matrix = local_matrix(world, parent) * matrix;
        current = parent;
    }
    tracing::warn!(?entity, "parent chain exceeds {MAX_HIERARCHY_DEPTH} levels; treating as root");
    Some(local_matrix(world, entity))
}

fn local_matrix(world: &World, entity: Entity) -> Mat4 {
    world.get::<Transform3D>(entity).map_or(Mat4::IDENTITY, Transform3D::matrix)
}

/// Writes a world pose by converting it into the parent's space.
pub fn set_world_matrix(world: &mut World, entity: Entity, matrix: Mat4) -> bool {
    if world.get_entity(entity).is_err() {
        return false;
    }
    let parent_world = world
        .get::<Parent>(entity)
        .and_then(|parent| world_matrix(world, parent.0))
        .unwrap_or(Mat4::IDENTITY);
    let local = Transform3D::from_matrix(parent_world.inverse() * matrix);
    if let Some(mut transform) = world.get_mut::<Transform3D>(entity) {
        *transform = local;
    } else {
        world.entity_mut(entity).insert(local);
    }
    true
}

pub fn parent_of(world: &World, entity: Entity) -> Option<Entity> {
    world.get::<Parent>(entity).map(|p| p.0)
}

pub fn children_of(world: &World, entity: Entity) -> &[Entity] {
    world.get::<Children>(entity).map(|children| children.0.as_slice()).unwrap_or(&[])
}

/// Appends `child` to `parent`'s ordered children, detaching it from any previous parent.
pub fn attach_child(world: &mut World, parent: Entity, child: Entity) {
    if parent == child || world.get_entity(parent).is_err() || world.get_entity(child).is_err() {
        return;
    }
    detach_child(world, child);
    world.entity_mut(child).insert(Parent(parent));
    if let Some(mut children) = world.get_mut::<Children>(parent) {
        children.0.push(child);
    } else {
        world.entity_mut(parent).insert(Children(vec![child]));
    }
}

pub fn detach_child(world: &mut World, child: Entity) {
    let Some(parent) = parent_of(world, child) else {
        return;
    };
    if let Some(mut children) = world.get_mut::<Children>(parent) {
        children.0.retain(|&c| c != child);
    }
    world.entity_mut(child).remove::<Parent>();
}

/// Depth-first pre-order walk of `root` and its descendants, following child order.
pub fn descendants(world: &World, root: Entity) -> Vec<Entity> {
    let mut out = Vec::new();
    let mut seen = HashSet::new();
    let mut stack: SmallVec<[Entity; 32]> = SmallVec::new();
    stack.push(root);
    while let Some(entity) = stack.pop() {
        if world.get_entity(entity).is_err() || !seen.insert(entity) {
            continue;
        }
        out.push(entity);
        for &child in children_of(world, entity).iter().rev() {
            stack.push(child);
        }
    }
    out
}

/// Despawns `root` and everything below it.
pub fn despawn_recursive(world: &mut World, root: Entity) {
    detach_child(world, root);
    for entity in descendants(world, root) {
        world.despawn(entity);
    }
}

pub fn is_active(world: &World, entity: Entity) -> bool {
    world.get::<Active>(entity).map_or(true, |active| active.0)
}

pub fn is_active_in_hierarchy(world: &World, entity: Entity) -> bool {
    let mut current = Some(entity);
    for _ in 0..MAX_HIERARCHY_DEPTH {
        let Some(node) = current else {
            return true;
        };
        if world.get_entity(node).is_err() || !is_active(world, node) {
            return false;
        }
        current = parent_of(world, node);
    }
    true
}

pub fn set_active(world: &mut World, entity: Entity, active: bool) {
    if world.get_entity(entity).is_err() {
        return;
    }
    if let Some(mut flag) = world.get_mut::<Active>(entity) {
        flag.0 = active;
    } else {
        world.entity_mut(entity).insert(Active(active));
    }
}
