use crate::ecs::{CollisionVolume, MeshRef, PhysicsBody, Renderer, SkinnedMesh};
use bevy_ecs::prelude::{Entity, World};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Kind of state a facet carries. Facets, not whole nodes, are the unit of cloning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacetKind {
    Pose,
    Body,
    Collider,
    Renderer,
    Mesh,
    SkinnedMesh,
}

impl FacetKind {
    pub const ALL: [FacetKind; 6] = [
        FacetKind::Pose,
        FacetKind::Body,
        FacetKind::Collider,
        FacetKind::Renderer,
        FacetKind::Mesh,
        FacetKind::SkinnedMesh,
    ];

    /// Supertype of this kind, if any.
    pub const fn parent(self) -> Option<FacetKind> {
        match self {
            FacetKind::SkinnedMesh => Some(FacetKind::Mesh),
            _ => None,
        }
    }

    /// True when `self` is `base` or derives from it.
    pub fn is_assignable_to(self, base: FacetKind) -> bool {
        let mut current = Some(self);
        while let Some(kind) = current {
            if kind == base {
                return true;
            }
            current = kind.parent();
        }
        false
    }

    pub const fn as_set(self) -> FacetKinds {
        match self {
            FacetKind::Pose => FacetKinds::POSE,
            FacetKind::Body => FacetKinds::BODY,
            FacetKind::Collider => FacetKinds::COLLIDER,
            FacetKind::Renderer => FacetKinds::RENDERER,
            FacetKind::Mesh => FacetKinds::MESH,
            FacetKind::SkinnedMesh => FacetKinds::SKINNED_MESH,
        }
    }

    /// Whether `entity` exposes this capability, counting subtypes.
    pub fn present_on(self, world: &World, entity: Entity) -> bool {
        let Ok(node) = world.get_entity(entity) else {
            return false;
        };
        match self {
            FacetKind::Pose => true,
            FacetKind::Body => node.contains::<PhysicsBody>(),
            FacetKind::Collider => node.contains::<CollisionVolume>(),
            FacetKind::Renderer => node.contains::<Renderer>(),
            FacetKind::Mesh => node.contains::<MeshRef>() || node.contains::<SkinnedMesh>(),
            FacetKind::SkinnedMesh => node.contains::<SkinnedMesh>(),
        }
    }

    /// Concrete (most derived) non-pose kinds attached to `entity`.
    pub fn attached_to(world: &World, entity: Entity) -> SmallVec<[FacetKind; 4]> {
        let mut out = SmallVec::new();
        let Ok(node) = world.get_entity(entity) else {
            return out;
        };
        if node.contains::<PhysicsBody>() {
            out.push(FacetKind::Body);
        }
        if node.contains::<CollisionVolume>() {
            out.push(FacetKind::Collider);
        }
        if node.contains::<Renderer>() {
            out.push(FacetKind::Renderer);
        }
        if node.contains::<MeshRef>() {
            out.push(FacetKind::Mesh);
        }
        if node.contains::<SkinnedMesh>() {
            out.push(FacetKind::SkinnedMesh);
        }
        out
    }

    pub fn label(self) -> &'static str {
        match self {
            FacetKind::Pose => "pose",
            FacetKind::Body => "body",
            FacetKind::Collider => "collider",
            FacetKind::Renderer => "renderer",
            FacetKind::Mesh => "mesh",
            FacetKind::SkinnedMesh => "skinned_mesh",
        }
    }
}

impl fmt::Display for FacetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

bitflags::bitflags! {
    /// A requested set of facet kinds.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FacetKinds: u8 {
        const POSE = 1 << 0;
        const BODY = 1 << 1;
        const COLLIDER = 1 << 2;
        const RENDERER = 1 << 3;
        const MESH = 1 << 4;
        const SKINNED_MESH = 1 << 5;
    }
}

impl FacetKinds {
    pub const fn physics() -> Self {
        Self::POSE.union(Self::BODY).union(Self::COLLIDER)
    }

    pub const fn render() -> Self {
        Self::POSE.union(Self::RENDERER).union(Self::MESH)
    }

    /// A kind is requested when it, or one of its supertypes, is in the set.
    pub fn contains_kind(self, kind: FacetKind) -> bool {
        let mut current = Some(kind);
        while let Some(kind) = current {
            if self.contains(kind.as_set()) {
                return true;
            }
            current = kind.parent();
        }
        false
    }
}

impl From<FacetKind> for FacetKinds {
    fn from(kind: FacetKind) -> Self {
        kind.as_set()
    }
}

impl FromIterator<FacetKind> for FacetKinds {
    fn from_iter<I: IntoIterator<Item = FacetKind>>(iter: I) -> Self {
        iter.into_iter().fold(FacetKinds::empty(), |set, kind| set | kind.as_set())
    }
}

/// One facet: a node plus the kind of state taken from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FacetRef {
    pub entity: Entity,
    pub kind: FacetKind,
}

impl FacetRef {
    pub const fn new(entity: Entity, kind: FacetKind) -> Self {
        Self { entity, kind }
    }

    pub const fn pose(entity: Entity) -> Self {
        Self::new(entity, FacetKind::Pose)
    }

    pub fn is_live(&self, world: &World) -> bool {
        self.kind.present_on(world, self.entity)
    }
}

/// Inclusion/exclusion policy applied before a facet is cloned.
///
/// With both allow lists empty every kind is allowed. Deny lists always win.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FacetFilter {
    pub include_exact: Vec<FacetKind>,
    pub include_assignable: Vec<FacetKind>,
    pub exclude_exact: Vec<FacetKind>,
    pub exclude_assignable: Vec<FacetKind>,
}

impl FacetFilter {
    pub fn admits(&self, kind: FacetKind) -> bool {
        let allowed = (self.include_exact.is_empty() && self.include_assignable.is_empty())
            || self.include_exact.contains(&kind)
            || self.include_assignable.iter().any(|&base| kind.is_assignable_to(base));
        let denied = self.exclude_exact.contains(&kind)
            || self.exclude_assignable.iter().any(|&base| kind.is_assignable_to(base));
        allowed && !denied
    }

    pub fn is_empty(&self) -> bool {
        self.include_exact.is_empty()
            && self.include_assignable.is_empty()
            && self.exclude_exact.is_empty()
            && self.exclude_assignable.is_empty()
    }

    /// Kinds named in both an allow list and a deny list; they can never be cloned.
    pub fn contradictions(&self) -> Vec<FacetKind> {
        FacetKind::ALL
            .into_iter()
            .filter(|&kind| {
                (self.include_exact.contains(&kind) || self.include_assignable.contains(&kind))
                    && (self.exclude_exact.contains(&kind) || self.exclude_assignable.contains(&kind))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skinned_mesh_counts_as_mesh() {
        assert!(FacetKind::SkinnedMesh.is_assignable_to(FacetKind::Mesh));
        assert!(!FacetKind::Mesh.is_assignable_to(FacetKind::SkinnedMesh));
        assert!(FacetKinds::render().contains_kind(FacetKind::SkinnedMesh));
        assert!(!FacetKinds::physics().contains_kind(FacetKind::SkinnedMesh));
    }

    #[test]
    fn deny_lists_override_allow_lists() {
        let filter = FacetFilter {
            include_assignable: vec![FacetKind::Mesh],
            exclude_exact: vec![FacetKind::SkinnedMesh],
            ..Default::default()
        };
        assert!(filter.admits(FacetKind::Mesh));
        assert!(!filter.admits(FacetKind::SkinnedMesh));
        assert!(!filter.admits(FacetKind::Renderer));
    }

    #[test]
    fn exact_allow_does_not_admit_subtypes() {
        let filter = FacetFilter { include_exact: vec![FacetKind::Mesh], ..Default::default() };
        assert!(filter.admits(FacetKind::Mesh));
        assert!(!filter.admits(FacetKind::SkinnedMesh));
    }
}
