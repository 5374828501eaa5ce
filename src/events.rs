use bevy_ecs::prelude::{Entity, Resource};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeleportPhase {
    Pre,
    Post,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortalEvent {
    CloneSpawned { owner: Entity, marker: Entity, root: Entity },
    CloneReused { owner: Entity, marker: Entity, root: Entity },
    CloneRetired { owner: Entity, marker: Entity, root: Entity },
    HandlerSwapped { owner: Entity, from: Entity, to: Entity, root: Entity },
    Teleported { node: Entity, portal: Entity, phase: TeleportPhase },
    StaticSliceRebuilt { original: Entity, front: bool, back: bool },
}

impl PortalEvent {
    pub fn clone_root(&self) -> Option<Entity> {
        match self {
            PortalEvent::CloneSpawned { root, .. }
            | PortalEvent::CloneReused { root, .. }
            | PortalEvent::CloneRetired { root, .. }
            | PortalEvent::HandlerSwapped { root, .. } => Some(*root),
            PortalEvent::Teleported { .. } | PortalEvent::StaticSliceRebuilt { .. } => None,
        }
    }
}

impl fmt::Display for PortalEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortalEvent::CloneSpawned { owner, marker, root } => {
                write!(f, "CloneSpawned owner={} marker={} root={}", owner.index(), marker.index(), root.index())
            }
            PortalEvent::CloneReused { owner, marker, root } => {
                write!(f, "CloneReused owner={} marker={} root={}", owner.index(), marker.index(), root.index())
            }
            PortalEvent::CloneRetired { owner, marker, root } => {
                write!(f, "CloneRetired owner={} marker={} root={}", owner.index(), marker.index(), root.index())
            }
            PortalEvent::HandlerSwapped { owner, from, to, root } => {
                write!(
                    f,
                    "HandlerSwapped owner={} from={} to={} root={}",
                    owner.index(),
                    from.index(),
                    to.index(),
                    root.index()
                )
            }
            PortalEvent::Teleported { node, portal, phase } => {
                write!(f, "Teleported node={} portal={} phase={:?}", node.index(), portal.index(), phase)
            }
            PortalEvent::StaticSliceRebuilt { original, front, back } => {
                write!(f, "StaticSliceRebuilt original={} front={} back={}", original.index(), front, back)
            }
        }
    }
}

#[derive(Default, Resource)]
pub struct EventBus {
    events: Vec<PortalEvent>,
}

impl EventBus {
    pub fn push(&mut self, event: PortalEvent) {
        self.events.push(event);
    }

    pub fn drain(&mut self) -> Vec<PortalEvent> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
