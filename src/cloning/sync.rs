//! Per-facet synchronizers. Each copies one kind of state from an original onto its
//! clone through a portal chain and is a no-op when either side is gone.

use super::facet::FacetKind;
use super::hierarchy::{ClonePair, CloneSet};
use crate::ecs::{
    set_world_matrix, world_matrix, Active, CollisionVolume, MeshRef, NodeLayer, NodeTag, PhysicsBody, Renderer,
    SkinnedMesh, Transform3D,
};
use crate::portal::PortalChain;
use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoseMode {
    /// Original world pose mapped through the chain; used for a handler's root node.
    World,
    /// Local pose copied unchanged; used below an already placed parent.
    Local,
}

fn both_alive(world: &World, pair: ClonePair) -> bool {
    let alive = world.get_entity(pair.original).is_ok() && world.get_entity(pair.clone).is_ok();
    if !alive {
        tracing::trace!(?pair, "clone pair has a destroyed side; sync skipped");
    }
    alive
}

fn rotation_translation(matrix: Mat4) -> (Vec3, Quat) {
    let (_, rotation, translation) = matrix.to_scale_rotation_translation();
    (translation, rotation.normalize())
}

pub fn sync_pose(world: &mut World, pair: ClonePair, chain: &PortalChain, mode: PoseMode) {
    if !both_alive(world, pair) {
        return;
    }
    match mode {
        PoseMode::World => {
            let Some(original) = world_matrix(world, pair.original) else {
                return;
            };
            let mapped = chain.apply_matrix(world, original);
            set_world_matrix(world, pair.clone, mapped);
        }
        PoseMode::Local => {
            let local = world.get::<Transform3D>(pair.original).copied().unwrap_or_default();
            world.entity_mut(pair.clone).insert(local);
        }
    }
}

/// Layer and tag are remapped by every portal in chain order; the active flag is copied.
pub fn sync_node_state(world: &mut World, pair: ClonePair, chain: &PortalChain) {
    if !both_alive(world, pair) {
        return;
    }
    let layer = world.get::<NodeLayer>(pair.original).map(|layer| NodeLayer(chain.apply_layer(world, layer.0)));
    let tag = world.get::<NodeTag>(pair.original).map(|tag| NodeTag(chain.apply_tag(world, &tag.0)));
    let active = world.get::<Active>(pair.original).copied().unwrap_or_default();
    let mut clone = world.entity_mut(pair.clone);
    match layer {
        Some(layer) => {
            clone.insert(layer);
        }
        None => {
            clone.remove::<NodeLayer>();
        }
    }
    match tag {
        Some(tag) => {
            clone.insert(tag);
        }
        None => {
            clone.remove::<NodeTag>();
        }
    }
    clone.insert(active);
}

/// Kinematic clones follow via a queued move; dynamic clones get pose and both
/// velocities mapped independently and applied without discarding history.
pub fn sync_body(world: &mut World, pair: ClonePair, chain: &PortalChain) {
    if !both_alive(world, pair) {
        return;
    }
    let Some(original) = world.get::<PhysicsBody>(pair.original).cloned() else {
        return;
    };
    if world.get::<PhysicsBody>(pair.clone).is_none() {
        return;
    }
    let (position, rotation) = rotation_translation(chain.apply_matrix(world, original.pose_matrix()));
    let velocities = (!original.kinematic).then(|| {
        (chain.apply_vector(world, original.linear_velocity), chain.apply_vector(world, original.angular_velocity))
    });
    let Some(mut clone) = world.get_mut::<PhysicsBody>(pair.clone) else {
        return;
    };
    clone.copy_settings_from(&original);
    match velocities {
        None => clone.move_to(position, rotation),
        Some((linear, angular)) => {
            clone.set_pose(position, rotation);
            clone.linear_velocity = linear;
            clone.angular_velocity = angular;
        }
    }
}

/// Shape parameters live in local space and are copied verbatim.
pub fn sync_collider(world: &mut World, pair: ClonePair) {
    if !both_alive(world, pair) {
        return;
    }
    let Some(original) = world.get::<CollisionVolume>(pair.original).cloned() else {
        return;
    };
    if let Some(mut clone) = world.get_mut::<CollisionVolume>(pair.clone) {
        if *clone != original {
            *clone = original;
        }
    }
}

pub fn sync_renderer(world: &mut World, pair: ClonePair) {
    if !both_alive(world, pair) {
        return;
    }
    let Some(original) = world.get::<Renderer>(pair.original).cloned() else {
        return;
    };
    let Some(mut clone) = world.get_mut::<Renderer>(pair.clone) else {
        return;
    };
    clone.materials.clone_from(&original.materials);
    clone.shadow_casting = original.shadow_casting;
    clone.receive_shadows = original.receive_shadows;
    clone.light_probes = original.light_probes;
    clone.sorting_layer = original.sorting_layer;
    clone.sorting_order = original.sorting_order;
    clone.enabled = original.enabled;
    if original.has_overrides() {
        let slots = original.overrides.len().max(clone.overrides.len());
        for slot in 0..slots {
            clone.set_override(slot, original.override_for(slot).cloned());
        }
    } else {
        clone.overrides.clear();
    }
}

/// Copies the shared mesh reference. Skinned meshes also carry their bone linkage,
/// remapped onto cloned bones where the set has them.
pub fn sync_mesh(world: &mut World, pair: ClonePair, set: &CloneSet) {
    if !both_alive(world, pair) {
        return;
    }
    if let Some(original) = world.get::<MeshRef>(pair.original).cloned() {
        if let Some(mut clone) = world.get_mut::<MeshRef>(pair.clone) {
            if clone.key != original.key {
                clone.key = original.key;
            }
        }
    }
    let Some(original) = world.get::<SkinnedMesh>(pair.original).cloned() else {
        return;
    };
    let Some(mut clone) = world.get_mut::<SkinnedMesh>(pair.clone) else {
        return;
    };
    let remap = |bone: Entity| set.clone_of(bone).unwrap_or(bone);
    clone.mesh = original.mesh;
    clone.bones = original.bones.iter().map(|&bone| remap(bone)).collect();
    clone.root_bone = original.root_bone.map(remap);
    clone.blend_shape_weights = original.blend_shape_weights;
}

pub fn sync_facet(world: &mut World, kind: FacetKind, pair: ClonePair, chain: &PortalChain, set: &CloneSet) {
    match kind {
        FacetKind::Pose => {
            let mode = if set.root() == Some(pair.clone) { PoseMode::World } else { PoseMode::Local };
            sync_pose(world, pair, chain, mode);
            sync_node_state(world, pair, chain);
        }
        FacetKind::Body => sync_body(world, pair, chain),
        FacetKind::Collider => sync_collider(world, pair),
        FacetKind::Renderer => sync_renderer(world, pair),
        FacetKind::Mesh | FacetKind::SkinnedMesh => sync_mesh(world, pair, set),
    }
}

/// Runs every synchronizer for a clone set: poses first, in depth-first order, then facets.
pub fn sync_clone_set(world: &mut World, set: &CloneSet, chain: &PortalChain) {
    for &pair in set.nodes() {
        sync_facet(world, FacetKind::Pose, pair, chain, set);
    }
    for &(kind, pair) in set.facets() {
        sync_facet(world, kind, pair, chain, set);
    }
}
