//! Builds clone sub-trees that mirror an original sub-tree.
//!
//! Bare mode materializes only the branches that carry a requested facet, synthesizing
//! intermediate nodes and placeholder siblings so child indices line up with the
//! original. Template mode walks a caller-supplied tree in parallel with the original
//! and never adds nodes to it.

use super::facet::{FacetFilter, FacetKind, FacetKinds, FacetRef};
use super::registry::CloneRegistry;
use crate::ecs::{
    attach_child, children_of, descendants, despawn_recursive, parent_of, Active, CloneMarker, CollisionVolume,
    MeshRef, NodeLayer, NodeTag, PhysicsBody, Renderer, SkinnedMesh, Transform3D,
};
use crate::portal::PortalChain;
use bevy_ecs::prelude::*;
use smallvec::SmallVec;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

const MAX_SYNTHESIZED_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClonePair {
    pub original: Entity,
    pub clone: Entity,
}

impl ClonePair {
    pub const fn new(original: Entity, clone: Entity) -> Self {
        Self { original, clone }
    }
}

/// Factory for a pre-built clone tree. Returning `None` falls back to bare mode.
#[derive(Clone)]
pub struct CloneTemplate(Arc<dyn Fn(&mut World) -> Option<Entity> + Send + Sync>);

impl CloneTemplate {
    pub fn new(factory: impl Fn(&mut World) -> Option<Entity> + Send + Sync + 'static) -> Self {
        Self(Arc::new(factory))
    }

    pub fn instantiate(&self, world: &mut World) -> Option<Entity> {
        let root = (self.0)(world)?;
        world.get_entity(root).is_ok().then_some(root)
    }
}

impl fmt::Debug for CloneTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CloneTemplate(..)")
    }
}

/// Every pair produced for one original root.
#[derive(Debug, Clone, Default)]
pub struct CloneSet {
    root: Option<ClonePair>,
    nodes: Vec<ClonePair>,
    facets: Vec<(FacetKind, ClonePair)>,
    placeholders: Vec<Entity>,
    clone_of: HashMap<Entity, Entity>,
    templated: bool,
}

impl CloneSet {
    pub fn root(&self) -> Option<Entity> {
        self.root.map(|pair| pair.clone)
    }

    pub fn original_root(&self) -> Option<Entity> {
        self.root.map(|pair| pair.original)
    }

    /// Pose pairs in original depth-first order; the root pair comes first.
    pub fn nodes(&self) -> &[ClonePair] {
        &self.nodes
    }

    pub fn facets(&self) -> &[(FacetKind, ClonePair)] {
        &self.facets
    }

    /// Pairs able to serve `kind`, subtypes included.
    pub fn pairs(&self, kind: FacetKind) -> Vec<ClonePair> {
        if kind == FacetKind::Pose {
            return self.nodes.clone();
        }
        self.facets.iter().filter(|(k, _)| k.is_assignable_to(kind)).map(|(_, pair)| *pair).collect()
    }

    pub fn placeholders(&self) -> &[Entity] {
        &self.placeholders
    }

    pub fn clone_of(&self, original: Entity) -> Option<Entity> {
        self.clone_of.get(&original).copied()
    }

    pub fn is_templated(&self) -> bool {
        self.templated
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// `(original, clone)` facet references, pose pairs included.
    pub fn facet_refs(&self) -> impl Iterator<Item = (FacetRef, FacetRef)> + '_ {
        let poses = self.nodes.iter().map(|pair| (FacetRef::pose(pair.original), FacetRef::pose(pair.clone)));
        let facets = self
            .facets
            .iter()
            .map(|(kind, pair)| (FacetRef::new(pair.original, *kind), FacetRef::new(pair.clone, *kind)));
        poses.chain(facets)
    }

    pub fn clone_refs(&self) -> impl Iterator<Item = FacetRef> + '_ {
        self.facet_refs().map(|(_, clone)| clone)
    }

    pub fn register(&self, registry: &mut CloneRegistry, chain: &PortalChain) {
        for (original, clone) in self.facet_refs() {
            registry.register(original, clone, chain.clone());
        }
    }

    pub fn unregister(&self, registry: &mut CloneRegistry) {
        for clone in self.clone_refs() {
            registry.unregister(clone);
        }
    }

    fn push_node(&mut self, pair: ClonePair) {
        if self.root.is_none() {
            self.root = Some(pair);
        }
        self.clone_of.insert(pair.original, pair.clone);
        self.nodes.push(pair);
    }

    fn push_facet(&mut self, kind: FacetKind, pair: ClonePair) {
        self.facets.push((kind, pair));
    }
}

/// Replicates `original_root` through `template` when one is given and instantiates,
/// otherwise in bare mode, then registers every pair under `chain`.
pub fn replicate(
    world: &mut World,
    original_root: Entity,
    template: Option<&CloneTemplate>,
    kinds: FacetKinds,
    filter: &FacetFilter,
    chain: &PortalChain,
) -> Option<CloneSet> {
    let templated = match template {
        Some(template) => match template.instantiate(world) {
            Some(template_root) => match replicate_into_template(world, original_root, template_root, kinds, filter) {
                Some(set) => Some(set),
                None => {
                    despawn_recursive(world, template_root);
                    return None;
                }
            },
            None => {
                tracing::debug!(?original_root, "clone template produced nothing; using bare replication");
                None
            }
        },
        None => None,
    };
    let set = match templated {
        Some(set) => set,
        None => replicate_bare(world, original_root, kinds, filter)?,
    };
    if let Some(mut registry) = world.get_resource_mut::<CloneRegistry>() {
        set.register(&mut registry, chain);
    }
    Some(set)
}

fn wanted(kinds: FacetKinds, filter: &FacetFilter, kind: FacetKind) -> bool {
    kinds.contains_kind(kind) && filter.admits(kind)
}

pub fn replicate_bare(
    world: &mut World,
    original_root: Entity,
    kinds: FacetKinds,
    filter: &FacetFilter,
) -> Option<CloneSet> {
    world.get_entity(original_root).ok()?;
    let mut set = CloneSet::default();
    let root = world.spawn(CloneMarker { original: Some(original_root) }).id();
    copy_node_state(world, original_root, root);
    set.push_node(ClonePair::new(original_root, root));

    for node in descendants(world, original_root) {
        let requested: SmallVec<[FacetKind; 4]> =
            FacetKind::attached_to(world, node).into_iter().filter(|&kind| wanted(kinds, filter, kind)).collect();
        if requested.is_empty() {
            continue;
        }
        let Some(clone) = ensure_node(world, &mut set, node) else {
            continue;
        };
        for kind in requested {
            copy_facet(world, kind, node, clone);
            set.push_facet(kind, ClonePair::new(node, clone));
            if kind == FacetKind::SkinnedMesh {
                let bones = world.get::<SkinnedMesh>(node).map(|mesh| mesh.bones.clone()).unwrap_or_default();
                for bone in bones {
                    ensure_node(world, &mut set, bone);
                }
            }
        }
    }
    Some(set)
}

/// Clone of `original`, synthesizing any missing ancestors up to an already cloned one.
/// Nodes outside the replicated sub-tree yield `None`.
fn ensure_node(world: &mut World, set: &mut CloneSet, original: Entity) -> Option<Entity> {
    if let Some(clone) = set.clone_of(original) {
        return Some(clone);
    }
    let mut path: SmallVec<[Entity; 16]> = SmallVec::new();
    path.push(original);
    let mut current = original;
    let anchor = loop {
        let parent = parent_of(world, current)?;
        if let Some(clone) = set.clone_of(parent) {
            break clone;
        }
        if path.len() >= MAX_SYNTHESIZED_DEPTH || path.contains(&parent) {
            return None;
        }
        path.push(parent);
        current = parent;
    };
    let mut clone_parent = anchor;
    for &node in path.iter().rev() {
        let original_parent = parent_of(world, node)?;
        let index = children_of(world, original_parent).iter().position(|&child| child == node)?;
        clone_parent = materialize_child(world, set, clone_parent, index, node);
    }
    Some(clone_parent)
}

fn materialize_child(world: &mut World, set: &mut CloneSet, clone_parent: Entity, index: usize, original: Entity) -> Entity {
    let existing = children_of(world, clone_parent).to_vec();
    let clone = match existing.get(index) {
        Some(&slot) if set.placeholders.contains(&slot) => {
            set.placeholders.retain(|&p| p != slot);
            world.entity_mut(slot).insert(CloneMarker { original: Some(original) });
            slot
        }
        Some(_) => {
            tracing::trace!(?original, index, "child slot already taken; appending clone");
            spawn_clone_child(world, clone_parent, original)
        }
        None => {
            for _ in existing.len()..index {
                let placeholder = world.spawn((CloneMarker { original: None }, Transform3D::default())).id();
                attach_child(world, clone_parent, placeholder);
                set.placeholders.push(placeholder);
            }
            spawn_clone_child(world, clone_parent, original)
        }
    };
    copy_node_state(world, original, clone);
    set.push_node(ClonePair::new(original, clone));
    clone
}

fn spawn_clone_child(world: &mut World, clone_parent: Entity, original: Entity) -> Entity {
    let clone = world.spawn(CloneMarker { original: Some(original) }).id();
    attach_child(world, clone_parent, clone);
    clone
}

/// Walks `original_root` and `template_root` in parallel, depth first, pairing nodes by
/// child index. Extra nodes on either side are left alone.
pub fn replicate_into_template(
    world: &mut World,
    original_root: Entity,
    template_root: Entity,
    kinds: FacetKinds,
    filter: &FacetFilter,
) -> Option<CloneSet> {
    world.get_entity(original_root).ok()?;
    world.get_entity(template_root).ok()?;
    let mut set = CloneSet { templated: true, ..CloneSet::default() };
    let mut stack = vec![(original_root, template_root)];
    while let Some((original, clone)) = stack.pop() {
        if world.get_entity(clone).is_err() || set.clone_of.contains_key(&original) {
            continue;
        }
        world.entity_mut(clone).insert(CloneMarker { original: Some(original) });
        copy_node_state(world, original, clone);
        set.push_node(ClonePair::new(original, clone));

        let template_kinds = FacetKind::attached_to(world, clone);
        for kind in FacetKind::attached_to(world, original) {
            if !wanted(kinds, filter, kind) {
                continue;
            }
            if template_kinds.contains(&kind) {
                set.push_facet(kind, ClonePair::new(original, clone));
            } else {
                tracing::trace!(?original, ?clone, %kind, "template node lacks facet; skipped");
            }
        }

        let original_children = children_of(world, original).to_vec();
        let template_children = children_of(world, clone).to_vec();
        for (&o, &t) in original_children.iter().zip(template_children.iter()).rev() {
            stack.push((o, t));
        }
    }
    Some(set)
}

fn copy_node_state(world: &mut World, original: Entity, clone: Entity) {
    let transform = world.get::<Transform3D>(original).copied().unwrap_or_default();
    let layer = world.get::<NodeLayer>(original).copied();
    let tag = world.get::<NodeTag>(original).cloned();
    let active = world.get::<Active>(original).copied().unwrap_or_default();
    let mut node = world.entity_mut(clone);
    node.insert((transform, active));
    if let Some(layer) = layer {
        node.insert(layer);
    }
    if let Some(tag) = tag {
        node.insert(tag);
    }
}

fn copy_facet(world: &mut World, kind: FacetKind, original: Entity, clone: Entity) {
    match kind {
        FacetKind::Pose => {}
        FacetKind::Body => copy_component::<PhysicsBody>(world, original, clone),
        FacetKind::Collider => copy_component::<CollisionVolume>(world, original, clone),
        FacetKind::Renderer => copy_component::<Renderer>(world, original, clone),
        FacetKind::Mesh => copy_component::<MeshRef>(world, original, clone),
        FacetKind::SkinnedMesh => copy_component::<SkinnedMesh>(world, original, clone),
    }
}

fn copy_component<C: Component + Clone>(world: &mut World, original: Entity, clone: Entity) {
    if let Some(value) = world.get::<C>(original).cloned() {
        world.entity_mut(clone).insert(value);
    }
}
