use crate::clipping::ColliderMesh;
use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3, Vec4};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Component, Clone, Copy, Debug, PartialEq)]
pub struct Transform3D {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}
impl Default for Transform3D {
    fn default() -> Self {
        Self { translation: Vec3::ZERO, rotation: Quat::IDENTITY, scale: Vec3::ONE }
    }
}
impl Transform3D {
    pub fn from_translation(translation: Vec3) -> Self {
        Self { translation, ..Self::default() }
    }

    pub fn from_translation_rotation(translation: Vec3, rotation: Quat) -> Self {
        Self { translation, rotation, scale: Vec3::ONE }
    }

    pub fn from_matrix(matrix: Mat4) -> Self {
        let (scale, rotation, translation) = matrix.to_scale_rotation_translation();
        Self { translation, rotation: rotation.normalize(), scale }
    }

    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * Vec3::Z
    }
}
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Parent(pub Entity);
#[derive(Component, Clone, Debug, Default)]
pub struct Children(pub Vec<Entity>);

#[derive(Component, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NodeLayer(pub u32);
#[derive(Component, Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeTag(pub String);

/// Node-level active flag. Nodes without the component count as active.
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Active(pub bool);
impl Default for Active {
    fn default() -> Self {
        Self(true)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BodyInterpolation {
    #[default]
    None,
    Interpolate,
    Extrapolate,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollisionDetection {
    #[default]
    Discrete,
    Continuous,
    ContinuousDynamic,
    ContinuousSpeculative,
}

/// Rigid body state. `position`/`rotation` are world space and are written back to
/// the node's `Transform3D` by the fixed-step integrator.
#[derive(Component, Clone, Debug, PartialEq)]
pub struct PhysicsBody {
    pub mass: f32,
    pub drag: f32,
    pub angular_drag: f32,
    pub kinematic: bool,
    pub use_gravity: bool,
    pub interpolation: BodyInterpolation,
    pub collision_detection: CollisionDetection,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
    pub position: Vec3,
    pub rotation: Quat,
    pub previous_position: Vec3,
    pub previous_rotation: Quat,
    move_target: Option<(Vec3, Quat)>,
}

impl PhysicsBody {
    pub fn dynamic(mass: f32) -> Self {
        Self {
            mass,
            drag: 0.0,
            angular_drag: 0.05,
            kinematic: false,
            use_gravity: true,
            interpolation: BodyInterpolation::None,
            collision_detection: CollisionDetection::Discrete,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            previous_position: Vec3::ZERO,
            previous_rotation: Quat::IDENTITY,
            move_target: None,
        }
    }

    pub fn kinematic() -> Self {
        Self { kinematic: true, use_gravity: false, ..Self::dynamic(1.0) }
    }

    pub fn at(mut self, position: Vec3, rotation: Quat) -> Self {
        self.teleport(position, rotation);
        self
    }

    pub fn with_velocity(mut self, linear: Vec3, angular: Vec3) -> Self {
        self.linear_velocity = linear;
        self.angular_velocity = angular;
        self
    }

    /// Queues a continuous move; the integrator reaches the target on the next fixed step.
    pub fn move_to(&mut self, position: Vec3, rotation: Quat) {
        self.move_target = Some((position, rotation));
    }

    /// Sets the pose but keeps the interpolation history.
    pub fn set_pose(&mut self, position: Vec3, rotation: Quat) {
        self.position = position;
        self.rotation = rotation;
    }

    pub fn teleport(&mut self, position: Vec3, rotation: Quat) {
        self.position = position;
        self.rotation = rotation;
        self.previous_position = position;
        self.previous_rotation = rotation;
        self.move_target = None;
    }

    pub fn pending_move(&self) -> Option<(Vec3, Quat)> {
        self.move_target
    }

    pub(crate) fn take_move_target(&mut self) -> Option<(Vec3, Quat)> {
        self.move_target.take()
    }

    pub fn pose_matrix(&self) -> Mat4 {
        Mat4::from_rotation_translation(self.rotation, self.position)
    }

    pub fn copy_settings_from(&mut self, other: &PhysicsBody) {
        self.mass = other.mass;
        self.drag = other.drag;
        self.angular_drag = other.angular_drag;
        self.kinematic = other.kinematic;
        self.use_gravity = other.use_gravity;
        self.interpolation = other.interpolation;
        self.collision_detection = other.collision_detection;
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CapsuleAxis {
    X,
    #[default]
    Y,
    Z,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ColliderShape {
    Sphere { radius: f32 },
    Box { size: Vec3 },
    Capsule { radius: f32, height: f32, axis: CapsuleAxis },
    Mesh(Arc<ColliderMesh>),
}

impl ColliderShape {
    /// Triangle geometry for shapes that can be sliced, offset by `center`.
    pub fn to_mesh(&self, center: Vec3) -> Option<ColliderMesh> {
        match self {
            ColliderShape::Box { size } => Some(ColliderMesh::cuboid(*size).translated(center)),
            ColliderShape::Mesh(mesh) => Some(mesh.translated(center)),
            ColliderShape::Sphere { .. } | ColliderShape::Capsule { .. } => None,
        }
    }
}

#[derive(Component, Clone, Debug, PartialEq)]
pub struct CollisionVolume {
    pub shape: ColliderShape,
    pub center: Vec3,
    pub material: Option<String>,
    pub is_trigger: bool,
    pub contact_offset: f32,
    pub enabled: bool,
}

impl CollisionVolume {
    pub fn new(shape: ColliderShape) -> Self {
        Self { shape, center: Vec3::ZERO, material: None, is_trigger: false, contact_offset: 0.01, enabled: true }
    }

    pub fn trigger(shape: ColliderShape) -> Self {
        Self { is_trigger: true, ..Self::new(shape) }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShadowCasting {
    Off,
    #[default]
    On,
    TwoSided,
    ShadowsOnly,
}

/// Per-instance material overrides for one material slot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PropertyBlock {
    pub values: BTreeMap<String, Vec4>,
}

impl PropertyBlock {
    pub fn with(mut self, name: impl Into<String>, value: Vec4) -> Self {
        self.values.insert(name.into(), value);
        self
    }
}

#[derive(Component, Clone, Debug, PartialEq)]
pub struct Renderer {
    pub materials: Vec<String>,
    pub shadow_casting: ShadowCasting,
    pub receive_shadows: bool,
    pub light_probes: bool,
    pub sorting_layer: i32,
    pub sorting_order: i32,
    pub enabled: bool,
    pub overrides: Vec<Option<PropertyBlock>>,
}

impl Renderer {
    pub fn new(materials: Vec<String>) -> Self {
        Self {
            materials,
            shadow_casting: ShadowCasting::On,
            receive_shadows: true,
            light_probes: true,
            sorting_layer: 0,
            sorting_order: 0,
            enabled: true,
            overrides: Vec::new(),
        }
    }

    pub fn has_overrides(&self) -> bool {
        self.overrides.iter().any(Option::is_some)
    }

    pub fn set_override(&mut self, slot: usize, block: Option<PropertyBlock>) {
        if self.overrides.len() <= slot {
            self.overrides.resize(slot + 1, None);
        }
        self.overrides[slot] = block;
    }

    pub fn override_for(&self, slot: usize) -> Option<&PropertyBlock> {
        self.overrides.get(slot).and_then(Option::as_ref)
    }
}

#[derive(Component, Clone, Debug, PartialEq, Eq)]
pub struct MeshRef {
    pub key: String,
}

#[derive(Component, Clone, Debug, PartialEq)]
pub struct SkinnedMesh {
    pub mesh: String,
    pub bones: Vec<Entity>,
    pub root_bone: Option<Entity>,
    pub blend_shape_weights: Vec<f32>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MarkerKind {
    Transition,
    Layer,
}

/// Marks a trigger volume (or an ancestor of one) as belonging to a portal.
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub struct PortalMarker {
    pub portal: Entity,
    pub kind: MarkerKind,
    pub connected: Option<Entity>,
}

/// Present on every node the engine spawned to mirror an original.
#[derive(Component, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CloneMarker {
    pub original: Option<Entity>,
}
