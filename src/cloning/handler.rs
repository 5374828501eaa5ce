use super::hierarchy::CloneSet;
use crate::portal::PortalChain;
use bevy_ecs::prelude::{Entity, Resource};
use std::collections::HashMap;
use std::fmt;

/// Stable handle into the [`HandlerArena`]; stale after the slot is vacated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId {
    index: u32,
    generation: u32,
}

impl HandlerId {
    pub fn index(self) -> u32 {
        self.index
    }
}

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// A tracked original root together with the driver that owns its handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerOwner {
    pub root: Entity,
    pub driver: &'static str,
}

#[derive(Debug, Clone)]
pub struct CloneHandler {
    pub owner: HandlerOwner,
    /// Portal-transition or portal-layer marker this handler is keyed on.
    pub marker: Entity,
    pub chain: PortalChain,
    pub set: CloneSet,
    pub active: bool,
}

impl CloneHandler {
    pub fn root(&self) -> Option<Entity> {
        self.set.root()
    }
}

#[derive(Debug, Default)]
struct Slot {
    generation: u32,
    handler: Option<CloneHandler>,
}

/// Reusable handler slots. Retired handlers keep their clone tree and wait on a
/// per-owner free list; vacated slots are recycled for any owner.
#[derive(Resource, Debug, Default)]
pub struct HandlerArena {
    slots: Vec<Slot>,
    pooled: HashMap<HandlerOwner, Vec<u32>>,
    vacant: Vec<u32>,
}

impl HandlerArena {
    pub fn insert(&mut self, handler: CloneHandler) -> HandlerId {
        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.handler = Some(handler);
        HandlerId { index, generation: slot.generation }
    }

    /// Pops a pooled handler of `owner` and marks it active.
    pub fn acquire_pooled(&mut self, owner: HandlerOwner) -> Option<HandlerId> {
        let free = self.pooled.get_mut(&owner)?;
        while let Some(index) = free.pop() {
            let slot = &mut self.slots[index as usize];
            if let Some(handler) = slot.handler.as_mut() {
                handler.active = true;
                return Some(HandlerId { index, generation: slot.generation });
            }
        }
        None
    }

    /// Returns an active handler to its owner's pool.
    pub fn release(&mut self, id: HandlerId) -> bool {
        let Some(handler) = self.get_mut(id) else {
            return false;
        };
        if !handler.active {
            return false;
        }
        handler.active = false;
        let owner = handler.owner;
        self.pooled.entry(owner).or_default().push(id.index);
        true
    }

    pub fn get(&self, id: HandlerId) -> Option<&CloneHandler> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.handler.as_ref()
    }

    pub fn get_mut(&mut self, id: HandlerId) -> Option<&mut CloneHandler> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.handler.as_mut()
    }

    /// Vacates one slot regardless of state.
    pub fn remove(&mut self, id: HandlerId) -> Option<CloneHandler> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let handler = slot.handler.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(id.index);
        if let Some(free) = self.pooled.get_mut(&handler.owner) {
            free.retain(|&index| index != id.index);
        }
        Some(handler)
    }

    /// Vacates every slot owned by `owner`, pooled or active, and hands the handlers back.
    pub fn purge_owner(&mut self, owner: HandlerOwner) -> Vec<CloneHandler> {
        self.pooled.remove(&owner);
        let mut out = Vec::new();
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if slot.handler.as_ref().is_some_and(|handler| handler.owner == owner) {
                if let Some(handler) = slot.handler.take() {
                    out.push(handler);
                }
                slot.generation = slot.generation.wrapping_add(1);
                self.vacant.push(index as u32);
            }
        }
        out
    }

    pub fn pooled_count(&self, owner: HandlerOwner) -> usize {
        self.pooled.get(&owner).map_or(0, Vec::len)
    }

    pub fn active_count(&self) -> usize {
        self.iter().filter(|(_, handler)| handler.active).count()
    }

    pub fn total_pooled(&self) -> usize {
        self.iter().filter(|(_, handler)| !handler.active).count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (HandlerId, &CloneHandler)> {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.handler
                .as_ref()
                .map(|handler| (HandlerId { index: index as u32, generation: slot.generation }, handler))
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy_ecs::world::World;

    fn handler(owner: HandlerOwner, marker: Entity) -> CloneHandler {
        CloneHandler { owner, marker, chain: PortalChain::empty(), set: CloneSet::default(), active: true }
    }

    #[test]
    fn released_handlers_are_reused_by_their_owner_only() {
        let mut world = World::new();
        let a = HandlerOwner { root: world.spawn_empty().id(), driver: "physics" };
        let b = HandlerOwner { root: a.root, driver: "render" };
        let marker = world.spawn_empty().id();
        let mut arena = HandlerArena::default();
        let id = arena.insert(handler(a, marker));
        assert!(arena.release(id));
        assert!(!arena.release(id));
        assert_eq!(arena.acquire_pooled(b), None);
        assert_eq!(arena.acquire_pooled(a), Some(id));
        assert!(arena.get(id).is_some_and(|h| h.active));
    }

    #[test]
    fn purged_slots_invalidate_old_ids() {
        let mut world = World::new();
        let owner = HandlerOwner { root: world.spawn_empty().id(), driver: "physics" };
        let marker = world.spawn_empty().id();
        let mut arena = HandlerArena::default();
        let id = arena.insert(handler(owner, marker));
        assert_eq!(arena.purge_owner(owner).len(), 1);
        assert!(arena.get(id).is_none());
        let next = arena.insert(handler(owner, marker));
        assert_eq!(next.index(), id.index());
        assert_ne!(next, id);
        assert_eq!(arena.capacity(), 1);
    }
}
