use bevy_ecs::prelude::{Entity, World};
use glam::{Mat4, Quat, Vec3, Vec4};
use kestrel_portals::cloning::sync::{sync_body, sync_collider, sync_node_state, sync_pose, sync_renderer};
use kestrel_portals::cloning::{ClonePair, PhysicsCloneDriver, PoseMode, TriggerPhase};
use kestrel_portals::ecs::{
    world_matrix, ColliderShape, CollisionVolume, MarkerKind, NodeLayer, NodeTag, PhysicsBody, PropertyBlock,
    Renderer, Transform3D,
};
use kestrel_portals::portal::{Portal, PortalChain, RigidPortal};
use kestrel_portals::PortalWorld;
use std::f32::consts::PI;

fn assert_vec3_near(actual: Vec3, expected: Vec3, eps: f32) {
    assert!(
        (actual - expected).abs().max_element() <= eps,
        "expected {expected:?}, got {actual:?} (eps {eps})"
    );
}

fn spawn_portal(world: &mut World, space: RigidPortal) -> Entity {
    world.spawn((Transform3D::default(), Portal::new(space))).id()
}

fn portal_transforms() -> [Mat4; 3] {
    [
        Mat4::from_rotation_translation(Quat::from_rotation_y(0.7), Vec3::new(3.0, 0.0, -1.0)),
        Mat4::from_rotation_translation(Quat::from_rotation_x(-1.1), Vec3::new(0.0, 5.0, 2.0)),
        Mat4::from_rotation_translation(
            Quat::from_axis_angle(Vec3::new(1.0, 1.0, 0.0).normalize(), 2.3),
            Vec3::new(-4.0, 1.0, 0.0),
        ),
    ]
}

#[test]
fn world_pose_composes_every_portal_in_order() {
    let original_pose = Transform3D::from_translation_rotation(Vec3::new(1.0, 2.0, 3.0), Quat::from_rotation_z(0.4));
    for n in 0..=3 {
        let mut world = World::new();
        let transforms = portal_transforms();
        let portals: Vec<Entity> =
            transforms.iter().take(n).map(|t| spawn_portal(&mut world, RigidPortal::new(*t))).collect();
        let original = world.spawn(original_pose).id();
        let clone = world.spawn(Transform3D::default()).id();
        let chain = PortalChain::from_portals(portals.iter().copied());

        sync_pose(&mut world, ClonePair::new(original, clone), &chain, PoseMode::World);

        let expected = transforms.iter().take(n).fold(original_pose.matrix(), |acc, t| *t * acc);
        let actual = world_matrix(&world, clone).expect("clone pose");
        assert!(actual.abs_diff_eq(expected, 1e-4), "chain of {n}: expected {expected:?}, got {actual:?}");
    }
}

#[test]
fn local_pose_is_copied_unchanged() {
    let mut world = World::new();
    let portal = spawn_portal(&mut world, RigidPortal::new(Mat4::from_translation(Vec3::X * 50.0)));
    let local = Transform3D::from_translation_rotation(Vec3::new(0.0, 1.5, 0.0), Quat::from_rotation_y(0.3));
    let original = world.spawn(local).id();
    let clone = world.spawn(Transform3D::default()).id();

    sync_pose(&mut world, ClonePair::new(original, clone), &PortalChain::single(portal), PoseMode::Local);
    assert_eq!(world.get::<Transform3D>(clone), Some(&local));
}

#[test]
fn half_turn_portal_mirrors_position_orientation_and_velocity() {
    let mut world = PortalWorld::new();
    let pivot = Vec3::new(0.0, 0.0, 10.0);
    let portal =
        world.spawn_portal(Transform3D::from_translation(pivot), RigidPortal::rotation_about(pivot, Vec3::Y, PI));
    let marker = world.spawn_marker(portal, MarkerKind::Transition, Vec3::new(0.0, 0.0, 8.0), Vec3::splat(2.0));
    let root = world.spawn_node(Transform3D::from_translation(Vec3::new(0.0, 0.0, 5.0)));
    world.attach_body(root, PhysicsBody::dynamic(1.0).with_velocity(Vec3::Z, Vec3::ZERO));
    world.add_physics_driver(root);

    world.push_trigger(root, marker, root, TriggerPhase::Enter);
    world.fixed_step(0.0);

    let clone = world.handler_roots::<PhysicsCloneDriver>(root)[&marker];
    assert_vec3_near(world.world_position(clone).expect("clone position"), Vec3::new(0.0, 0.0, 15.0), 1e-4);
    let transform = world.world.get::<Transform3D>(clone).expect("clone transform");
    assert_vec3_near(transform.forward(), Vec3::NEG_Z, 1e-4);
    let body = world.world.get::<PhysicsBody>(clone).expect("clone body");
    assert_vec3_near(body.linear_velocity, Vec3::NEG_Z, 1e-4);
    assert_vec3_near(body.position, Vec3::new(0.0, 0.0, 15.0), 1e-4);
}

#[test]
fn moving_original_is_mirrored_every_fixed_tick() {
    let mut world = PortalWorld::new();
    let pivot = Vec3::new(0.0, 0.0, 10.0);
    let space = RigidPortal::rotation_about(pivot, Vec3::Y, PI);
    let mapping = space.transform;
    let portal = world.spawn_portal(Transform3D::from_translation(pivot), space);
    let marker = world.spawn_marker(portal, MarkerKind::Transition, Vec3::new(0.0, 0.0, 8.0), Vec3::splat(2.0));
    let root = world.spawn_node(Transform3D::from_translation(Vec3::new(0.0, 0.0, 5.0)));
    let mut body = PhysicsBody::dynamic(1.0).with_velocity(Vec3::new(0.5, 0.0, 1.0), Vec3::new(0.0, 0.2, 0.0));
    body.use_gravity = false;
    world.attach_body(root, body);
    world.add_physics_driver(root);

    let dt = 0.1;
    world.push_trigger(root, marker, root, TriggerPhase::Enter);
    world.fixed_step(dt);
    for _ in 0..10 {
        world.push_trigger(root, marker, root, TriggerPhase::Stay);
        world.fixed_step(dt);
        let clone = world.handler_roots::<PhysicsCloneDriver>(root)[&marker];
        let original = world_matrix(&world.world, root).expect("original pose");
        let mirrored = world_matrix(&world.world, clone).expect("clone pose");
        assert!(mirrored.abs_diff_eq(mapping * original, 1e-3), "clone drifted: {mirrored:?}");
    }
    assert_vec3_near(world.world_position(root).expect("original position"), Vec3::new(0.55, 0.0, 6.1), 1e-3);
}

#[test]
fn kinematic_clone_follows_through_a_queued_move() {
    let mut world = PortalWorld::new();
    let portal = world.spawn_portal(
        Transform3D::default(),
        RigidPortal::new(Mat4::from_translation(Vec3::new(0.0, 0.0, 10.0))),
    );
    let original = world.spawn_node(Transform3D::from_translation(Vec3::X));
    world.attach_body(original, PhysicsBody::kinematic());
    let clone = world.spawn_node(Transform3D::default());
    world.attach_body(clone, PhysicsBody::dynamic(2.0));

    sync_body(&mut world.world, ClonePair::new(original, clone), &PortalChain::single(portal));
    let body = world.world.get::<PhysicsBody>(clone).expect("clone body");
    assert!(body.kinematic);
    assert_eq!(body.mass, 1.0);
    let (position, rotation) = body.pending_move().expect("queued move");
    assert_vec3_near(position, Vec3::new(1.0, 0.0, 10.0), 1e-5);
    assert!(rotation.abs_diff_eq(Quat::IDENTITY, 1e-5));
    assert_vec3_near(body.position, Vec3::ZERO, 1e-6);

    world.fixed_step(1.0 / 60.0);
    let body = world.world.get::<PhysicsBody>(clone).expect("clone body");
    assert!(body.pending_move().is_none());
    assert_vec3_near(world.world_position(clone).expect("clone position"), Vec3::new(1.0, 0.0, 10.0), 1e-5);
}

#[test]
fn dynamic_velocities_are_mapped_as_vectors() {
    let mut world = World::new();
    let space = RigidPortal::new(Mat4::from_rotation_translation(
        Quat::from_rotation_x(PI / 2.0),
        Vec3::new(100.0, 0.0, 0.0),
    ));
    let portal = spawn_portal(&mut world, space);
    let original = world
        .spawn(PhysicsBody::dynamic(3.0).with_velocity(Vec3::Y * 2.0, Vec3::Y).at(Vec3::ZERO, Quat::IDENTITY))
        .id();
    let clone = world.spawn(PhysicsBody::dynamic(1.0)).id();

    sync_body(&mut world, ClonePair::new(original, clone), &PortalChain::single(portal));
    let body = world.get::<PhysicsBody>(clone).expect("clone body");
    assert_vec3_near(body.linear_velocity, Vec3::Z * 2.0, 1e-5);
    assert_vec3_near(body.angular_velocity, Vec3::Z, 1e-5);
    assert_vec3_near(body.position, Vec3::new(100.0, 0.0, 0.0), 1e-5);
    assert_eq!(body.mass, 3.0);
    assert!(body.pending_move().is_none());
}

#[test]
fn renderer_overrides_follow_and_clear() {
    let mut world = World::new();
    let mut renderer = Renderer::new(vec!["glass".into(), "metal".into()]);
    renderer.sorting_order = 4;
    renderer.set_override(1, Some(PropertyBlock::default().with("_Tint", Vec4::new(1.0, 0.0, 0.0, 1.0))));
    let original = world.spawn(renderer).id();
    let clone = world.spawn(Renderer::new(Vec::new())).id();
    let pair = ClonePair::new(original, clone);

    sync_renderer(&mut world, pair);
    let mirrored = world.get::<Renderer>(clone).expect("clone renderer");
    assert_eq!(mirrored.materials, vec!["glass".to_string(), "metal".to_string()]);
    assert_eq!(mirrored.sorting_order, 4);
    assert!(mirrored.override_for(0).is_none());
    assert_eq!(mirrored.override_for(1).and_then(|block| block.values.get("_Tint")).copied(), Some(Vec4::new(1.0, 0.0, 0.0, 1.0)));

    world.get_mut::<Renderer>(original).expect("original renderer").set_override(1, None);
    sync_renderer(&mut world, pair);
    assert!(!world.get::<Renderer>(clone).expect("clone renderer").has_overrides());
}

#[test]
fn collider_parameters_are_copied_verbatim() {
    let mut world = World::new();
    let portal = spawn_portal(&mut world, RigidPortal::new(Mat4::from_scale(Vec3::splat(2.0))));
    let mut volume = CollisionVolume::new(ColliderShape::Box { size: Vec3::new(1.0, 2.0, 3.0) });
    volume.center = Vec3::new(0.0, 0.5, 0.0);
    volume.material = Some("ice".into());
    let original = world.spawn(volume.clone()).id();
    let clone = world.spawn(CollisionVolume::new(ColliderShape::Sphere { radius: 1.0 })).id();
    let pair = ClonePair::new(original, clone);

    sync_pose(&mut world, pair, &PortalChain::single(portal), PoseMode::World);
    sync_collider(&mut world, pair);
    assert_eq!(world.get::<CollisionVolume>(clone), Some(&volume));
}

#[test]
fn layer_and_tag_are_remapped_by_each_portal() {
    let mut world = World::new();
    let first = spawn_portal(&mut world, RigidPortal::identity().with_layer(1, 2).with_tag("inside", "between"));
    let second = spawn_portal(&mut world, RigidPortal::identity().with_layer(2, 5).with_tag("between", "outside"));
    let original = world.spawn((NodeLayer(1), NodeTag("inside".into()))).id();
    let clone = world.spawn((NodeLayer(0), NodeTag(String::new()))).id();

    sync_node_state(&mut world, ClonePair::new(original, clone), &PortalChain::from_portals([first, second]));
    assert_eq!(world.get::<NodeLayer>(clone), Some(&NodeLayer(5)));
    assert_eq!(world.get::<NodeTag>(clone), Some(&NodeTag("outside".into())));

    sync_node_state(&mut world, ClonePair::new(original, clone), &PortalChain::single(second));
    assert_eq!(world.get::<NodeLayer>(clone), Some(&NodeLayer(1)));
    assert_eq!(world.get::<NodeTag>(clone), Some(&NodeTag("inside".into())));
}

#[test]
fn destroyed_side_makes_sync_a_no_op() {
    let mut world = World::new();
    let portal = spawn_portal(&mut world, RigidPortal::new(Mat4::from_translation(Vec3::Y)));
    let original = world.spawn((Transform3D::from_translation(Vec3::X), PhysicsBody::dynamic(1.0))).id();
    let clone = world.spawn((Transform3D::default(), PhysicsBody::dynamic(1.0))).id();
    let pair = ClonePair::new(original, clone);
    world.despawn(original);

    sync_pose(&mut world, pair, &PortalChain::single(portal), PoseMode::World);
    sync_body(&mut world, pair, &PortalChain::single(portal));
    assert_eq!(world.get::<Transform3D>(clone), Some(&Transform3D::default()));
    assert_eq!(world.get::<PhysicsBody>(clone), Some(&PhysicsBody::dynamic(1.0)));

    let dead_clone = world.spawn_empty().id();
    world.despawn(dead_clone);
    let live = world.spawn(Transform3D::from_translation(Vec3::Z)).id();
    sync_pose(&mut world, ClonePair::new(live, dead_clone), &PortalChain::empty(), PoseMode::World);
    assert!(world.get_entity(dead_clone).is_err());
}
