use super::driver::{bump_metrics, emit};
use super::facet::{FacetKind, FacetRef};
use super::hierarchy::ClonePair;
use super::registry::CloneRegistry;
use super::sync::{sync_node_state, sync_pose, PoseMode};
use crate::clipping::{ClippingService, CuttingPlane, SliceOutput};
use crate::ecs::profiler::profile_exclusive;
use crate::ecs::{
    despawn_recursive, set_active, world_matrix, CloneMarker, ColliderShape, CollisionVolume, Transform3D,
};
use crate::events::PortalEvent;
use crate::portal::{portal_plane, PortalChain};
use bevy_ecs::prelude::*;
use glam::Vec3;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecomputeMode {
    /// Re-slice whenever the portal plane moved relative to the collider.
    #[default]
    EveryTick,
    /// Re-slice only after an explicit request.
    OnDemand,
}

/// Splits a static collider along a portal plane into two clones: the front part stays
/// in place, the back part is carried through the portal.
#[derive(Component, Debug, Clone)]
pub struct StaticCloneDriver {
    pub portal: Entity,
    pub recompute: RecomputeMode,
    pub plane_tolerance: f32,
    pub disable_original: bool,
    enabled: bool,
    front: Option<Entity>,
    back: Option<Entity>,
    last_plane: Option<CuttingPlane>,
    recompute_requested: bool,
    original_enabled: Option<bool>,
    unsliceable: bool,
}

impl StaticCloneDriver {
    pub fn new(portal: Entity) -> Self {
        Self {
            portal,
            recompute: RecomputeMode::EveryTick,
            plane_tolerance: 1e-3,
            disable_original: false,
            enabled: true,
            front: None,
            back: None,
            last_plane: None,
            recompute_requested: false,
            original_enabled: None,
            unsliceable: false,
        }
    }

    pub fn with_recompute(mut self, recompute: RecomputeMode) -> Self {
        self.recompute = recompute;
        self
    }

    pub fn with_plane_tolerance(mut self, tolerance: f32) -> Self {
        self.plane_tolerance = tolerance;
        self
    }

    pub fn with_disable_original(mut self, disable: bool) -> Self {
        self.disable_original = disable;
        self
    }

    pub fn front(&self) -> Option<Entity> {
        self.front
    }

    pub fn back(&self) -> Option<Entity> {
        self.back
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Plane of the last slice, in the collider's local space.
    pub fn last_plane(&self) -> Option<CuttingPlane> {
        self.last_plane
    }

    pub fn request_recompute(&mut self) {
        self.recompute_requested = true;
    }

    fn needs_rebuild(&self, plane: &CuttingPlane) -> bool {
        if self.front.is_none() || self.back.is_none() || self.last_plane.is_none() {
            return true;
        }
        match self.recompute {
            RecomputeMode::EveryTick => {
                !self.last_plane.is_some_and(|last| last.approx_eq(plane, self.plane_tolerance))
            }
            RecomputeMode::OnDemand => self.recompute_requested,
        }
    }
}

/// Tags a sliced clone with the collider it was cut from.
#[derive(Component, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticSlice {
    pub original: Entity,
}

pub fn sys_update_static_clones(world: &mut World) {
    profile_exclusive(world, "sys_update_static_clones", |world| {
        reap_orphaned_slices(world);
        let mut query = world.query_filtered::<Entity, With<StaticCloneDriver>>();
        let originals: Vec<Entity> = query.iter(world).collect();
        for original in originals {
            let Some(mut driver) = world.get::<StaticCloneDriver>(original).cloned() else {
                continue;
            };
            if !driver.enabled {
                continue;
            }
            update_static(world, original, &mut driver);
            if let Some(mut slot) = world.get_mut::<StaticCloneDriver>(original) {
                *slot = driver;
            }
        }
    });
}

/// Destroys sliced clones whose original was despawned or no longer drives them.
pub fn reap_orphaned_slices(world: &mut World) -> usize {
    let mut query = world.query::<(Entity, &StaticSlice)>();
    let scene: &World = world;
    let orphaned: Vec<Entity> = query
        .iter(scene)
        .filter(|(clone, slice)| {
            !scene
                .get::<StaticCloneDriver>(slice.original)
                .is_some_and(|driver| driver.front == Some(*clone) || driver.back == Some(*clone))
        })
        .map(|(clone, _)| clone)
        .collect();
    for &clone in &orphaned {
        if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
            registry.unregister_entity(clone);
        }
        despawn_recursive(world, clone);
    }
    if !orphaned.is_empty() {
        tracing::debug!(clones = orphaned.len(), "reaped orphaned static slices");
    }
    orphaned.len()
}

fn update_static(world: &mut World, original: Entity, driver: &mut StaticCloneDriver) {
    let Some(volume) = world.get::<CollisionVolume>(original).cloned() else {
        return;
    };
    let (Some(matrix), Some((point, normal))) = (world_matrix(world, original), portal_plane(world, driver.portal))
    else {
        return;
    };
    let plane = CuttingPlane::new(point, normal).transformed(matrix.inverse());
    if driver.needs_rebuild(&plane) {
        rebuild(world, original, driver, &volume, plane);
    }
    let empty = PortalChain::empty();
    let through = PortalChain::single(driver.portal);
    for (clone, chain) in [(driver.front, &empty), (driver.back, &through)] {
        let Some(clone) = clone else {
            continue;
        };
        let pair = ClonePair::new(original, clone);
        sync_pose(world, pair, chain, PoseMode::World);
        sync_node_state(world, pair, chain);
    }
}

fn rebuild(
    world: &mut World,
    original: Entity,
    driver: &mut StaticCloneDriver,
    volume: &CollisionVolume,
    plane: CuttingPlane,
) {
    let Some(mesh) = volume.shape.to_mesh(volume.center) else {
        if !driver.unsliceable {
            tracing::debug!(?original, "collider shape cannot be sliced; static clones skipped");
            driver.unsliceable = true;
        }
        return;
    };
    let service = world.get_resource::<ClippingService>().cloned().unwrap_or_default();
    let front_slice = service.slice(&mesh, &[plane]);
    let back_slice = service.slice(&mesh, &[plane.flipped()]);
    let source_enabled = driver.original_enabled.unwrap_or(volume.enabled);
    let (front_kept, back_kept) = (front_slice.has_remaining_geometry, back_slice.has_remaining_geometry);

    let front = upsert_clone(world, driver.front, original, volume, front_slice, source_enabled);
    let back = upsert_clone(world, driver.back, original, volume, back_slice, source_enabled);
    driver.front = Some(front);
    driver.back = Some(back);
    driver.last_plane = Some(plane);
    driver.recompute_requested = false;

    if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
        for (clone, chain) in [(front, PortalChain::empty()), (back, PortalChain::single(driver.portal))] {
            registry.register(FacetRef::pose(original), FacetRef::pose(clone), chain.clone());
            registry.register(
                FacetRef::new(original, FacetKind::Collider),
                FacetRef::new(clone, FacetKind::Collider),
                chain,
            );
        }
    }

    if driver.disable_original && driver.original_enabled.is_none() {
        driver.original_enabled = Some(volume.enabled);
        if let Some(mut collider) = world.get_mut::<CollisionVolume>(original) {
            collider.enabled = false;
        }
    }

    bump_metrics(world, |metrics| metrics.static_rebuilds += 1);
    tracing::debug!(?original, front = front_kept, back = back_kept, "static collider re-sliced");
    emit(world, PortalEvent::StaticSliceRebuilt { original, front: front_kept, back: back_kept });
}

/// Writes a sliced volume onto an existing clone, or spawns one. A side with no
/// geometry left keeps its previous shape and is disabled.
fn upsert_clone(
    world: &mut World,
    existing: Option<Entity>,
    original: Entity,
    volume: &CollisionVolume,
    slice: SliceOutput,
    source_enabled: bool,
) -> Entity {
    let existing = existing.filter(|clone| world.get_entity(*clone).is_ok());
    let previous = existing.and_then(|clone| world.get::<CollisionVolume>(clone)).cloned();
    let (shape, center) = match (slice.has_remaining_geometry, previous) {
        (true, _) => (ColliderShape::Mesh(Arc::new(slice.mesh)), Vec3::ZERO),
        (false, Some(previous)) => (previous.shape, previous.center),
        (false, None) => (volume.shape.clone(), volume.center),
    };
    let collider = CollisionVolume {
        shape,
        center,
        material: volume.material.clone(),
        is_trigger: volume.is_trigger,
        contact_offset: volume.contact_offset,
        enabled: slice.has_remaining_geometry && source_enabled,
    };
    match existing {
        Some(clone) => {
            world.entity_mut(clone).insert(collider);
            clone
        }
        None => world
            .spawn((CloneMarker { original: Some(original) }, StaticSlice { original }, Transform3D::default(), collider))
            .id(),
    }
}

/// Enables or disables the static driver on `original`. Disabling deactivates both
/// clones, drops their links and restores the original collider.
pub fn set_static_enabled(world: &mut World, original: Entity, enabled: bool) -> bool {
    let Some(mut driver) = world.get::<StaticCloneDriver>(original).cloned() else {
        return false;
    };
    driver.enabled = enabled;
    let clones: Vec<Entity> = [driver.front, driver.back].into_iter().flatten().collect();
    for &clone in &clones {
        set_active(world, clone, enabled);
    }
    if !enabled {
        if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
            for &clone in &clones {
                registry.unregister_entity(clone);
            }
        }
        if let Some(was_enabled) = driver.original_enabled.take() {
            if let Some(mut collider) = world.get_mut::<CollisionVolume>(original) {
                collider.enabled = was_enabled;
            }
        }
        driver.last_plane = None;
    }
    if let Some(mut slot) = world.get_mut::<StaticCloneDriver>(original) {
        *slot = driver;
    }
    true
}

/// Removes the static driver and destroys its clones.
pub fn remove_static_driver(world: &mut World, original: Entity) -> bool {
    if !set_static_enabled(world, original, false) {
        return false;
    }
    let Some(driver) = world.get::<StaticCloneDriver>(original).cloned() else {
        return false;
    };
    for clone in [driver.front, driver.back].into_iter().flatten() {
        if world.get_entity(clone).is_ok() {
            despawn_recursive(world, clone);
        }
    }
    world.entity_mut(original).remove::<StaticCloneDriver>();
    true
}
