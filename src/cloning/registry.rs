use super::facet::{FacetKind, FacetRef};
use crate::portal::PortalChain;
use bevy_ecs::prelude::{Entity, Resource, World};
use std::collections::{HashMap, HashSet};

/// Upper bound on clone-of-clone hops followed by [`CloneRegistry::resolve_root`].
const MAX_CHAIN_DEPTH: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneLink {
    pub original: FacetRef,
    pub chain: PortalChain,
}

/// Bidirectional original/clone bookkeeping, one entry per clone facet.
///
/// A clone maps to exactly one original. Re-registering a clone under another
/// original drops the stale reverse entry first.
#[derive(Resource, Default, Debug)]
pub struct CloneRegistry {
    links: HashMap<FacetRef, CloneLink>,
    clones: HashMap<FacetRef, Vec<FacetRef>>,
}

impl CloneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, original: FacetRef, clone: FacetRef, chain: PortalChain) {
        if let Some(previous) = self.links.get(&clone) {
            if previous.original != original {
                let stale = previous.original;
                self.unlink_reverse(stale, clone);
            }
        }
        self.links.insert(clone, CloneLink { original, chain });
        let reverse = self.clones.entry(original).or_default();
        if !reverse.contains(&clone) {
            reverse.push(clone);
        }
    }

    pub fn unregister(&mut self, clone: FacetRef) -> Option<CloneLink> {
        let link = self.links.remove(&clone)?;
        self.unlink_reverse(link.original, clone);
        Some(link)
    }

    /// Drops every link in which `entity` takes part, on either side.
    pub fn unregister_entity(&mut self, entity: Entity) -> usize {
        let doomed: Vec<FacetRef> = self
            .links
            .iter()
            .filter(|(clone, link)| clone.entity == entity || link.original.entity == entity)
            .map(|(clone, _)| *clone)
            .collect();
        for clone in &doomed {
            self.unregister(*clone);
        }
        doomed.len()
    }

    fn unlink_reverse(&mut self, original: FacetRef, clone: FacetRef) {
        if let Some(reverse) = self.clones.get_mut(&original) {
            reverse.retain(|c| *c != clone);
            if reverse.is_empty() {
                self.clones.remove(&original);
            }
        }
    }

    /// Live clones of `original` able to serve `kind`.
    ///
    /// Both sides are capability checked, so a mesh request is answered by skinned mesh
    /// pairs as well. Destroyed originals or clones yield nothing.
    pub fn resolve(&self, world: &World, original: Entity, kind: FacetKind) -> Vec<FacetRef> {
        if !kind.present_on(world, original) {
            return Vec::new();
        }
        let mut out = Vec::new();
        for original_kind in FacetKind::ALL {
            if !original_kind.is_assignable_to(kind) {
                continue;
            }
            let Some(clones) = self.clones.get(&FacetRef::new(original, original_kind)) else {
                continue;
            };
            out.extend(
                clones
                    .iter()
                    .filter(|clone| clone.kind.is_assignable_to(kind) && kind.present_on(world, clone.entity))
                    .copied(),
            );
        }
        out
    }

    /// Registered clones of one exact facet, without liveness checks.
    pub fn clones_of(&self, original: FacetRef) -> &[FacetRef] {
        self.clones.get(&original).map(|clones| clones.as_slice()).unwrap_or(&[])
    }

    pub fn resolve_original(&self, clone: FacetRef) -> Option<FacetRef> {
        self.links.get(&clone).map(|link| link.original)
    }

    /// Original node of a cloned node, through its pose link.
    pub fn original_node(&self, clone: Entity) -> Option<Entity> {
        self.resolve_original(FacetRef::pose(clone)).map(|original| original.entity)
    }

    pub fn link(&self, clone: FacetRef) -> Option<&CloneLink> {
        self.links.get(&clone)
    }

    pub fn chain(&self, clone: FacetRef) -> Option<&PortalChain> {
        self.links.get(&clone).map(|link| &link.chain)
    }

    /// Follows clone-of-clone links to the first facet that is not itself a clone,
    /// returning it with the cumulative chain from that facet to `clone`.
    pub fn resolve_root(&self, clone: FacetRef) -> Option<(FacetRef, PortalChain)> {
        let first = self.links.get(&clone)?;
        let mut root = first.original;
        let mut chain = first.chain.clone();
        let mut seen = HashSet::from([clone]);
        for _ in 0..MAX_CHAIN_DEPTH {
            let Some(link) = self.links.get(&root) else {
                return Some((root, chain));
            };
            if !seen.insert(root) {
                tracing::warn!(?clone, "clone links form a cycle");
                return None;
            }
            chain = link.chain.then(&chain);
            root = link.original;
        }
        tracing::warn!(?clone, "clone links exceed {MAX_CHAIN_DEPTH} hops");
        None
    }

    /// Rewrites the chain of every listed clone in place; returns how many were registered.
    pub fn replace_portal_chain(&mut self, clones: impl IntoIterator<Item = FacetRef>, chain: &PortalChain) -> usize {
        let mut replaced = 0;
        for clone in clones {
            if let Some(link) = self.links.get_mut(&clone) {
                link.chain = chain.clone();
                replaced += 1;
            }
        }
        replaced
    }

    /// Drops links whose original or clone no longer exposes its facet.
    pub fn prune(&mut self, world: &World) -> usize {
        let dead: Vec<FacetRef> = self
            .links
            .iter()
            .filter(|(clone, link)| !clone.is_live(world) || !link.original.is_live(world))
            .map(|(clone, _)| *clone)
            .collect();
        for clone in &dead {
            self.unregister(*clone);
        }
        if !dead.is_empty() {
            tracing::trace!(count = dead.len(), "pruned dead clone links");
        }
        dead.len()
    }

    pub fn contains_clone(&self, clone: FacetRef) -> bool {
        self.links.contains_key(&clone)
    }

    pub fn links(&self) -> impl Iterator<Item = (&FacetRef, &CloneLink)> {
        self.links.iter()
    }

    pub fn originals(&self) -> impl Iterator<Item = (&FacetRef, &[FacetRef])> {
        self.clones.iter().map(|(original, clones)| (original, clones.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn clear(&mut self) {
        self.links.clear();
        self.clones.clear();
    }
}
