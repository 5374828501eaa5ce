use crate::ecs::profiler::profile_exclusive;
use crate::ecs::{is_active_in_hierarchy, parent_of, PortalMarker};
use bevy_ecs::prelude::*;
use std::collections::{BTreeMap, BTreeSet};

const MAX_MARKER_SEARCH_DEPTH: usize = 64;

/// A touching trigger volume plus the node whose collider touched it. The source
/// tells an original apart from one of its own clones touching the same volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TriggerKey {
    pub volume: Entity,
    pub source: Entity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerPhase {
    Enter,
    Stay,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerContact {
    /// Tracked original root whose occupancy set receives the contact.
    pub owner: Entity,
    pub key: TriggerKey,
    pub phase: TriggerPhase,
}

/// Collision callbacks queued by the host, drained once per fixed tick.
#[derive(Resource, Debug, Default)]
pub struct TriggerContacts {
    queue: Vec<TriggerContact>,
}

impl TriggerContacts {
    pub fn push(&mut self, contact: TriggerContact) {
        self.queue.push(contact);
    }

    pub fn drain(&mut self) -> Vec<TriggerContact> {
        std::mem::take(&mut self.queue)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

/// Reconciled set of marker volumes overlapping a tracked root.
#[derive(Component, Debug, Default, Clone)]
pub struct TriggerOccupancy {
    entries: BTreeMap<TriggerKey, Entity>,
    touched: BTreeSet<TriggerKey>,
}

impl TriggerOccupancy {
    pub fn enter(&mut self, key: TriggerKey, marker: Entity) {
        self.entries.insert(key, marker);
        self.touched.insert(key);
    }

    pub fn exit(&mut self, key: TriggerKey) {
        self.entries.remove(&key);
        self.touched.remove(&key);
    }

    /// Distinct markers currently occupied, in entity order.
    pub fn markers(&self) -> Vec<Entity> {
        let unique: BTreeSet<Entity> = self.entries.values().copied().collect();
        unique.into_iter().collect()
    }

    pub fn marker_for(&self, key: TriggerKey) -> Option<Entity> {
        self.entries.get(&key).copied()
    }

    /// Points every entry keyed on `from` at `to`.
    pub fn retarget(&mut self, from: Entity, to: Entity) -> usize {
        let mut moved = 0;
        for marker in self.entries.values_mut() {
            if *marker == from {
                *marker = to;
                moved += 1;
            }
        }
        moved
    }

    /// Drops entries not refreshed since the last reconcile, plus any whose volume or
    /// marker is gone or inactive; stay callbacks alone cannot report those.
    pub fn reconcile(&mut self, world: &World) -> usize {
        let before = self.entries.len();
        let touched = std::mem::take(&mut self.touched);
        self.entries.retain(|key, marker| {
            touched.contains(key)
                && is_active_in_hierarchy(world, key.volume)
                && world.get::<PortalMarker>(*marker).is_some()
                && is_active_in_hierarchy(world, *marker)
        });
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.touched.clear();
    }
}

/// Nearest node at or above `volume` carrying a [`PortalMarker`].
pub fn find_marker(world: &World, volume: Entity) -> Option<Entity> {
    let mut current = Some(volume);
    for _ in 0..MAX_MARKER_SEARCH_DEPTH {
        let node = current?;
        if world.get::<PortalMarker>(node).is_some() {
            return Some(node);
        }
        current = parent_of(world, node);
    }
    None
}

pub fn sys_reconcile_trigger_occupancy(world: &mut World) {
    profile_exclusive(world, "sys_reconcile_trigger_occupancy", |world| {
        let contacts = world.get_resource_mut::<TriggerContacts>().map(|mut queue| queue.drain()).unwrap_or_default();
        for contact in contacts {
            let marker = match contact.phase {
                TriggerPhase::Enter | TriggerPhase::Stay => find_marker(world, contact.key.volume),
                TriggerPhase::Exit => None,
            };
            let Some(mut occupancy) = world.get_mut::<TriggerOccupancy>(contact.owner) else {
                tracing::trace!(owner = ?contact.owner, "trigger contact for untracked node");
                continue;
            };
            match (contact.phase, marker) {
                (TriggerPhase::Exit, _) => occupancy.exit(contact.key),
                (_, Some(marker)) => occupancy.enter(contact.key, marker),
                (_, None) => {}
            }
        }

        let mut tracked = world.query_filtered::<Entity, With<TriggerOccupancy>>();
        let owners: Vec<Entity> = tracked.iter(world).collect();
        for owner in owners {
            let Some(mut occupancy) = world.get_mut::<TriggerOccupancy>(owner).map(|mut o| std::mem::take(&mut *o))
            else {
                continue;
            };
            let dropped = occupancy.reconcile(world);
            if dropped > 0 {
                tracing::trace!(?owner, dropped, "trigger entries dropped on reconcile");
            }
            if let Some(mut slot) = world.get_mut::<TriggerOccupancy>(owner) {
                *slot = occupancy;
            }
        }
    });
}
