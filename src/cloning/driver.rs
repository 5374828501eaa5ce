//! Lifecycle drivers for moving clones.
//!
//! Each tick runs in three passes per driver kind: rank the occupied markers, admit or
//! retire handlers against the ranked set, then synchronize every live handler. The
//! schedule chains them so a synchronizer never sees a half-built or retired handler.

use super::facet::{FacetFilter, FacetKinds};
use super::handler::{CloneHandler, HandlerArena, HandlerId, HandlerOwner};
use super::hierarchy::{replicate, CloneTemplate};
use super::occupancy::TriggerOccupancy;
use super::registry::CloneRegistry;
use super::sync::sync_clone_set;
use crate::ecs::profiler::profile_exclusive;
use crate::ecs::{despawn_recursive, set_active, world_matrix, PortalMarker};
use crate::events::{EventBus, PortalEvent};
use crate::portal::PortalChain;
use bevy_ecs::prelude::*;
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct DriverSettings {
    /// Handlers kept alive at once; -1 means uncapped. Lower values are rejected when
    /// the driver is attached.
    pub max_clones: i32,
    pub kinds: FacetKinds,
    pub filter: FacetFilter,
    pub template: Option<CloneTemplate>,
}

impl DriverSettings {
    pub fn new(kinds: FacetKinds) -> Self {
        Self { max_clones: -1, kinds: kinds | FacetKinds::POSE, filter: FacetFilter::default(), template: None }
    }

    pub fn physics() -> Self {
        Self::new(FacetKinds::physics())
    }

    pub fn render() -> Self {
        Self::new(FacetKinds::render())
    }

    pub fn with_max_clones(mut self, max_clones: i32) -> Self {
        self.max_clones = max_clones;
        self
    }

    pub fn with_filter(mut self, filter: FacetFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_template(mut self, template: CloneTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn capacity(&self) -> Option<usize> {
        usize::try_from(self.max_clones).ok()
    }
}

#[derive(Debug, Clone)]
pub struct CloneDriverState {
    pub settings: DriverSettings,
    enabled: bool,
    handlers: BTreeMap<Entity, HandlerId>,
    ranked: Vec<(Entity, f32)>,
    admitted: Vec<Entity>,
}

impl CloneDriverState {
    pub fn new(settings: DriverSettings) -> Self {
        Self { settings, enabled: true, handlers: BTreeMap::new(), ranked: Vec::new(), admitted: Vec::new() }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn handler_for(&self, marker: Entity) -> Option<HandlerId> {
        self.handlers.get(&marker).copied()
    }

    pub fn handlers(&self) -> impl Iterator<Item = (Entity, HandlerId)> + '_ {
        self.handlers.iter().map(|(&marker, &id)| (marker, id))
    }

    /// Every candidate of the last ranking pass, nearest first.
    pub fn ranked(&self) -> &[(Entity, f32)] {
        &self.ranked
    }

    pub fn admitted(&self) -> &[Entity] {
        &self.admitted
    }
}

pub struct DriverSpans {
    pub rank: &'static str,
    pub admit: &'static str,
    pub sync: &'static str,
}

/// Component holding one driver's state on a tracked original root.
pub trait CloneDriver: Component + Sized {
    const NAME: &'static str;
    const SPANS: DriverSpans;

    fn from_settings(settings: DriverSettings) -> Self;
    fn state(&self) -> &CloneDriverState;
    fn state_mut(&mut self) -> &mut CloneDriverState;

    fn owner(root: Entity) -> HandlerOwner {
        HandlerOwner { root, driver: Self::NAME }
    }
}

/// Physics-relevant clones, advanced on the fixed tick.
#[derive(Component, Debug, Clone)]
pub struct PhysicsCloneDriver(pub CloneDriverState);

/// Render-relevant clones, advanced on the frame tick.
#[derive(Component, Debug, Clone)]
pub struct RenderCloneDriver(pub CloneDriverState);

impl CloneDriver for PhysicsCloneDriver {
    const NAME: &'static str = "physics";
    const SPANS: DriverSpans = DriverSpans {
        rank: "sys_rank_physics_candidates",
        admit: "sys_admit_physics_handlers",
        sync: "sys_sync_physics_clones",
    };

    fn from_settings(settings: DriverSettings) -> Self {
        Self(CloneDriverState::new(settings))
    }

    fn state(&self) -> &CloneDriverState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CloneDriverState {
        &mut self.0
    }
}

impl CloneDriver for RenderCloneDriver {
    const NAME: &'static str = "render";
    const SPANS: DriverSpans = DriverSpans {
        rank: "sys_rank_render_candidates",
        admit: "sys_admit_render_handlers",
        sync: "sys_sync_render_clones",
    };

    fn from_settings(settings: DriverSettings) -> Self {
        Self(CloneDriverState::new(settings))
    }

    fn state(&self) -> &CloneDriverState {
        &self.0
    }

    fn state_mut(&mut self) -> &mut CloneDriverState {
        &mut self.0
    }
}

#[derive(Resource, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CloneMetrics {
    pub active_handlers: usize,
    pub pooled_handlers: usize,
    pub created: u64,
    pub reused: u64,
    pub retired: u64,
    pub swapped: u64,
    pub static_rebuilds: u64,
}

pub(crate) fn emit(world: &mut World, event: PortalEvent) {
    if let Some(mut bus) = world.get_resource_mut::<EventBus>() {
        bus.push(event);
    }
}

pub(crate) fn bump_metrics(world: &mut World, apply: impl FnOnce(&mut CloneMetrics)) {
    if let Some(mut metrics) = world.get_resource_mut::<CloneMetrics>() {
        apply(&mut metrics);
    }
}

fn driver_roots<D: CloneDriver>(world: &mut World) -> Vec<Entity> {
    let mut query = world.query_filtered::<Entity, With<D>>();
    let mut roots: Vec<Entity> = query.iter(world).collect();
    roots.sort();
    roots
}

fn refresh_handler_counts(world: &mut World) {
    let (active, pooled) = match world.get_resource::<HandlerArena>() {
        Some(arena) => (arena.active_count(), arena.total_pooled()),
        None => return,
    };
    bump_metrics(world, |metrics| {
        metrics.active_handlers = active;
        metrics.pooled_handlers = pooled;
    });
}

/// Orders occupied markers by distance from the tracked root, ties broken by entity,
/// and keeps the nearest `max_clones` as the admitted set.
pub fn sys_rank_candidates<D: CloneDriver>(world: &mut World) {
    profile_exclusive(world, D::SPANS.rank, |world| {
        for root in driver_roots::<D>(world) {
            if !world.get::<D>(root).is_some_and(|driver| driver.state().enabled) {
                continue;
            }
            let Some(origin) = world_matrix(world, root).map(|m| m.w_axis.truncate()) else {
                continue;
            };
            let markers = world.get::<TriggerOccupancy>(root).map(TriggerOccupancy::markers).unwrap_or_default();
            let mut ranked: Vec<(Entity, f32)> = markers
                .into_iter()
                .filter_map(|marker| {
                    let position = world_matrix(world, marker)?.w_axis.truncate();
                    Some((marker, position.distance(origin)))
                })
                .collect();
            ranked.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            let Some(mut driver) = world.get_mut::<D>(root) else {
                continue;
            };
            let state = driver.state_mut();
            let keep = state.settings.capacity().unwrap_or(usize::MAX);
            state.admitted = ranked.iter().take(keep).map(|(marker, _)| *marker).collect();
            state.ranked = ranked;
        }
    });
}

/// Retires handlers that fell out of the admitted set, then begins handlers for newly
/// admitted markers, reusing pooled ones first.
pub fn sys_admit_handlers<D: CloneDriver>(world: &mut World) {
    profile_exclusive(world, D::SPANS.admit, |world| {
        reap_orphaned_handlers::<D>(world);
        for root in driver_roots::<D>(world) {
            let Some(driver) = world.get::<D>(root) else {
                continue;
            };
            let state = driver.state();
            if !state.enabled {
                continue;
            }
            let stale: Vec<(Entity, HandlerId)> =
                state.handlers().filter(|(marker, _)| !state.admitted.contains(marker)).collect();
            let missing: Vec<Entity> =
                state.admitted.iter().copied().filter(|marker| !state.handlers.contains_key(marker)).collect();
            for (marker, id) in stale {
                retire_handler::<D>(world, root, marker, id);
            }
            for marker in missing {
                begin_handler::<D>(world, root, marker);
            }
        }
        if let Some(mut registry) = world.remove_resource::<CloneRegistry>() {
            registry.prune(world);
            world.insert_resource(registry);
        }
        refresh_handler_counts(world);
    });
}

/// Destroys the handlers of `D` whose tracked root was despawned or lost its driver
/// without going through [`remove_driver`], and vacates their slots.
pub fn reap_orphaned_handlers<D: CloneDriver>(world: &mut World) -> usize {
    let orphaned: Vec<HandlerOwner> = match world.get_resource::<HandlerArena>() {
        Some(arena) => {
            let mut owners: Vec<HandlerOwner> = arena
                .iter()
                .map(|(_, handler)| handler.owner)
                .filter(|owner| owner.driver == D::NAME && world.get::<D>(owner.root).is_none())
                .collect();
            owners.sort();
            owners.dedup();
            owners
        }
        None => return 0,
    };
    let mut reaped = 0;
    for owner in orphaned {
        let purged = world.resource_mut::<HandlerArena>().purge_owner(owner);
        for handler in &purged {
            if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
                handler.set.unregister(&mut registry);
            }
            if let Some(clone_root) = handler.root().filter(|e| world.get_entity(*e).is_ok()) {
                despawn_recursive(world, clone_root);
            }
        }
        tracing::debug!(driver = D::NAME, root = ?owner.root, handlers = purged.len(), "reaped orphaned clone handlers");
        reaped += purged.len();
    }
    if reaped > 0 {
        refresh_handler_counts(world);
    }
    reaped
}

pub fn sys_sync_clones<D: CloneDriver>(world: &mut World) {
    profile_exclusive(world, D::SPANS.sync, |world| {
        if !world.contains_resource::<HandlerArena>() {
            return;
        }
        world.resource_scope(|world, arena: Mut<HandlerArena>| {
            for (_, handler) in arena.iter() {
                if !handler.active || handler.owner.driver != D::NAME {
                    continue;
                }
                if !world.get::<D>(handler.owner.root).is_some_and(|driver| driver.state().enabled) {
                    continue;
                }
                sync_clone_set(world, &handler.set, &handler.chain);
            }
        });
    });
}

/// Brings a handler for `marker` to life; pooled handlers of the same root are reused
/// before a new clone tree is replicated.
pub fn begin_handler<D: CloneDriver>(world: &mut World, root: Entity, marker: Entity) -> Option<HandlerId> {
    let portal = world.get::<PortalMarker>(marker)?.portal;
    let chain = PortalChain::single(portal);
    let owner = D::owner(root);
    world.get_resource::<HandlerArena>()?;

    let reused = world.resource_scope(|world, mut arena: Mut<HandlerArena>| {
        let id = arena.acquire_pooled(owner)?;
        let clone_root = arena.get(id).and_then(CloneHandler::root).filter(|e| world.get_entity(*e).is_ok());
        let Some(clone_root) = clone_root else {
            tracing::debug!(?root, "pooled clone tree was destroyed; discarding handler");
            arena.remove(id);
            return None;
        };
        let handler = arena.get_mut(id)?;
        handler.marker = marker;
        handler.chain = chain.clone();
        if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
            handler.set.register(&mut registry, &chain);
        }
        set_active(world, clone_root, true);
        Some((id, clone_root))
    });

    let (id, clone_root, event) = match reused {
        Some((id, clone_root)) => {
            bump_metrics(world, |metrics| metrics.reused += 1);
            (id, clone_root, PortalEvent::CloneReused { owner: root, marker, root: clone_root })
        }
        None => {
            let settings = world.get::<D>(root)?.state().settings.clone();
            let set = replicate(
                world,
                root,
                settings.template.as_ref(),
                settings.kinds | FacetKinds::POSE,
                &settings.filter,
                &chain,
            )?;
            let clone_root = set.root()?;
            let handler = CloneHandler { owner, marker, chain, set, active: true };
            let id = world.resource_mut::<HandlerArena>().insert(handler);
            bump_metrics(world, |metrics| metrics.created += 1);
            (id, clone_root, PortalEvent::CloneSpawned { owner: root, marker, root: clone_root })
        }
    };

    if let Some(mut driver) = world.get_mut::<D>(root) {
        driver.state_mut().handlers.insert(marker, id);
    }
    tracing::debug!(driver = D::NAME, ?root, ?marker, ?clone_root, handler = %id, "clone handler begun");
    emit(world, event);
    Some(id)
}

/// Pools a handler: its clone tree is deactivated and its registry links dropped.
pub fn retire_handler<D: CloneDriver>(world: &mut World, root: Entity, marker: Entity, id: HandlerId) {
    let clone_root = if world.contains_resource::<HandlerArena>() {
        world.resource_scope(|world, mut arena: Mut<HandlerArena>| {
            let handler = arena.get(id)?;
            let clone_root = handler.root();
            if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
                handler.set.unregister(&mut registry);
            }
            if let Some(clone_root) = clone_root {
                set_active(world, clone_root, false);
            }
            arena.release(id);
            clone_root
        })
    } else {
        None
    };
    if let Some(mut driver) = world.get_mut::<D>(root) {
        let state = driver.state_mut();
        state.handlers.remove(&marker);
        state.admitted.retain(|m| *m != marker);
    }
    bump_metrics(world, |metrics| metrics.retired += 1);
    tracing::debug!(driver = D::NAME, ?root, ?marker, handler = %id, "clone handler retired");
    if let Some(clone_root) = clone_root {
        emit(world, PortalEvent::CloneRetired { owner: root, marker, root: clone_root });
    }
}

/// Enables or disables a driver. Disabling retires every handler before returning.
pub fn set_driver_enabled<D: CloneDriver>(world: &mut World, root: Entity, enabled: bool) -> bool {
    let Some(mut driver) = world.get_mut::<D>(root) else {
        return false;
    };
    let state = driver.state_mut();
    state.enabled = enabled;
    if enabled {
        return true;
    }
    state.ranked.clear();
    state.admitted.clear();
    let handlers: Vec<(Entity, HandlerId)> = state.handlers().collect();
    for (marker, id) in handlers {
        retire_handler::<D>(world, root, marker, id);
    }
    refresh_handler_counts(world);
    true
}

/// Removes a driver outright, destroying its pooled clone trees.
pub fn remove_driver<D: CloneDriver>(world: &mut World, root: Entity) -> usize {
    set_driver_enabled::<D>(world, root, false);
    if let Ok(mut entity) = world.get_entity_mut(root) {
        entity.remove::<D>();
    }
    let purged = match world.get_resource_mut::<HandlerArena>() {
        Some(mut arena) => arena.purge_owner(D::owner(root)),
        None => Vec::new(),
    };
    for handler in &purged {
        if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
            handler.set.unregister(&mut registry);
        }
        if let Some(clone_root) = handler.root().filter(|e| world.get_entity(*e).is_ok()) {
            despawn_recursive(world, clone_root);
        }
    }
    refresh_handler_counts(world);
    purged.len()
}

/// Swaps handlers watching `portal` onto the connected marker after `root` crossed it,
/// rewriting portal chains in place instead of rebuilding the clones.
pub fn swap_on_teleport<D: CloneDriver>(world: &mut World, root: Entity, portal: Entity) -> usize {
    if !world.contains_resource::<HandlerArena>() {
        return 0;
    }
    let Some(driver) = world.get::<D>(root) else {
        return 0;
    };
    let watching: Vec<(Entity, HandlerId)> = driver
        .state()
        .handlers()
        .filter(|(marker, _)| world.get::<PortalMarker>(*marker).is_some_and(|m| m.portal == portal))
        .collect();
    let mut swapped = 0;
    for (marker, id) in watching {
        let Some(connected) = world.get::<PortalMarker>(marker).and_then(|m| m.connected) else {
            tracing::trace!(?marker, "marker has no connected counterpart; nothing to swap");
            continue;
        };
        let Some(far_portal) = world.get::<PortalMarker>(connected).map(|m| m.portal) else {
            continue;
        };
        if world.get::<D>(root).is_some_and(|driver| driver.state().handler_for(connected).is_some()) {
            tracing::trace!(?connected, "connected marker already has a handler");
            continue;
        }
        let chain = PortalChain::single(far_portal);
        let clone_root = world.resource_scope(|world, mut arena: Mut<HandlerArena>| {
            let handler = arena.get_mut(id)?;
            handler.marker = connected;
            handler.chain = chain.clone();
            if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
                registry.replace_portal_chain(handler.set.clone_refs(), &chain);
            }
            handler.root()
        });
        let Some(clone_root) = clone_root else {
            continue;
        };
        if let Some(mut driver) = world.get_mut::<D>(root) {
            let state = driver.state_mut();
            state.handlers.remove(&marker);
            state.handlers.insert(connected, id);
            for admitted in state.admitted.iter_mut() {
                if *admitted == marker {
                    *admitted = connected;
                }
            }
        }
        if let Some(mut occupancy) = world.get_mut::<TriggerOccupancy>(root) {
            occupancy.retarget(marker, connected);
        }
        bump_metrics(world, |metrics| metrics.swapped += 1);
        tracing::debug!(driver = D::NAME, ?root, from = ?marker, to = ?connected, "clone handler swapped");
        emit(world, PortalEvent::HandlerSwapped { owner: root, from: marker, to: connected, root: clone_root });
        swapped += 1;
    }
    swapped
}

/// Clone roots of the live handlers of driver `D` on `root`, keyed by marker.
pub fn handler_roots<D: CloneDriver>(world: &World, root: Entity) -> BTreeMap<Entity, Entity> {
    let (Some(driver), Some(arena)) = (world.get::<D>(root), world.get_resource::<HandlerArena>()) else {
        return BTreeMap::new();
    };
    driver
        .state()
        .handlers()
        .filter_map(|(marker, id)| {
            let handler = arena.get(id).filter(|handler| handler.active)?;
            Some((marker, handler.root()?))
        })
        .collect()
}
