use bevy_ecs::prelude::Entity;
use glam::Vec3;
use kestrel_portals::cloning::{
    DriverSettings, FacetRef, HandlerArena, PhysicsCloneDriver, RenderCloneDriver, TriggerOccupancy, TriggerPhase,
};
use kestrel_portals::ecs::{
    attach_child, is_active, ColliderShape, CollisionVolume, MarkerKind, Renderer, TickKind, Transform3D,
};
use kestrel_portals::events::{PortalEvent, TeleportPhase};
use kestrel_portals::portal::RigidPortal;
use kestrel_portals::PortalWorld;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

const MARKER_SIZE: Vec3 = Vec3::splat(0.5);

fn assert_vec3_near(actual: Vec3, expected: Vec3, eps: f32) {
    assert!(
        (actual - expected).abs().max_element() <= eps,
        "expected {expected:?}, got {actual:?} (eps {eps})"
    );
}

fn spawn_tracked_root(world: &mut PortalWorld) -> Entity {
    let root = world.spawn_node(Transform3D::default());
    world
        .world
        .entity_mut(root)
        .insert(CollisionVolume::new(ColliderShape::Box { size: Vec3::ONE }));
    root
}

/// Five markers at distances 1..=5 from the origin, spawned in shuffled order so entity
/// ids do not follow distance.
fn spawn_marker_ring(world: &mut PortalWorld, portal: Entity) -> Vec<Entity> {
    let mut distances: Vec<f32> = (1..=5).map(|d| d as f32).collect();
    distances.shuffle(&mut StdRng::seed_from_u64(7));
    let mut spawned: Vec<(f32, Entity)> = distances
        .into_iter()
        .map(|d| (d, world.spawn_marker(portal, MarkerKind::Transition, Vec3::new(d, 0.0, 0.0), MARKER_SIZE)))
        .collect();
    spawned.sort_by(|a, b| a.0.total_cmp(&b.0));
    spawned.into_iter().map(|(_, marker)| marker).collect()
}

fn touch(world: &mut PortalWorld, root: Entity, markers: &[Entity], phase: TriggerPhase) {
    for &marker in markers {
        world.push_trigger(root, marker, root, phase);
    }
}

fn spawn_identity_portal(world: &mut PortalWorld) -> Entity {
    world.spawn_portal(Transform3D::default(), RigidPortal::identity())
}

#[test]
fn capacity_admits_nearest_markers_and_grows_without_churn() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let markers = spawn_marker_ring(&mut world, portal);
    assert!(world.add_driver::<PhysicsCloneDriver>(root, DriverSettings::physics().with_max_clones(2)));

    touch(&mut world, root, &markers, TriggerPhase::Enter);
    world.fixed_step(0.0);
    let first = world.handler_roots::<PhysicsCloneDriver>(root);
    assert_eq!(first.keys().copied().collect::<Vec<_>>(), sorted(&markers[..2]));

    assert!(world.set_max_clones::<PhysicsCloneDriver>(root, 3));
    touch(&mut world, root, &markers, TriggerPhase::Stay);
    world.fixed_step(0.0);
    let second = world.handler_roots::<PhysicsCloneDriver>(root);
    assert_eq!(second.keys().copied().collect::<Vec<_>>(), sorted(&markers[..3]));
    for marker in &markers[..2] {
        assert_eq!(first[marker], second[marker], "existing clone for {marker:?} was rebuilt");
    }

    let metrics = world.metrics();
    assert_eq!(metrics.created, 3);
    assert_eq!(metrics.retired, 0);
    assert_eq!(metrics.active_handlers, 3);
}

fn sorted(markers: &[Entity]) -> Vec<Entity> {
    let mut out = markers.to_vec();
    out.sort();
    out
}

#[test]
fn steady_occupancy_does_not_churn_handlers() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let markers = spawn_marker_ring(&mut world, portal);
    world.add_driver::<PhysicsCloneDriver>(root, DriverSettings::physics().with_max_clones(2));

    touch(&mut world, root, &markers, TriggerPhase::Enter);
    world.fixed_step(1.0 / 60.0);
    let before = world.handler_roots::<PhysicsCloneDriver>(root);
    for _ in 0..10 {
        touch(&mut world, root, &markers, TriggerPhase::Stay);
        world.fixed_step(1.0 / 60.0);
    }
    assert_eq!(world.handler_roots::<PhysicsCloneDriver>(root), before);
    let metrics = world.metrics();
    assert_eq!(metrics.created, 2);
    assert_eq!(metrics.retired, 0);
    assert_eq!(metrics.reused, 0);

    let profiler = world.profiler();
    assert_eq!(profiler.ticks(TickKind::Fixed), 11);
    assert_eq!(profiler.samples("sys_rank_physics_candidates"), 11);
    assert_eq!(profiler.samples("sys_rank_render_candidates"), 0);
}

#[test]
fn equal_distances_break_ties_by_entity() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let east = world.spawn_marker(portal, MarkerKind::Transition, Vec3::X, MARKER_SIZE);
    let west = world.spawn_marker(portal, MarkerKind::Transition, -Vec3::X, MARKER_SIZE);
    world.add_driver::<PhysicsCloneDriver>(root, DriverSettings::physics().with_max_clones(1));

    touch(&mut world, root, &[west, east], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let roots = world.handler_roots::<PhysicsCloneDriver>(root);
    assert_eq!(roots.keys().copied().collect::<Vec<_>>(), vec![east.min(west)]);
}

#[test]
fn unlimited_and_zero_caps() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let uncapped = spawn_tracked_root(&mut world);
    let blocked = spawn_tracked_root(&mut world);
    let markers = spawn_marker_ring(&mut world, portal);
    world.add_driver::<PhysicsCloneDriver>(uncapped, DriverSettings::physics());
    world.add_driver::<PhysicsCloneDriver>(blocked, DriverSettings::physics().with_max_clones(0));

    touch(&mut world, uncapped, &markers, TriggerPhase::Enter);
    touch(&mut world, blocked, &markers, TriggerPhase::Enter);
    world.fixed_step(0.0);
    assert_eq!(world.handler_roots::<PhysicsCloneDriver>(uncapped).len(), 5);
    assert!(world.handler_roots::<PhysicsCloneDriver>(blocked).is_empty());
}

#[test]
fn leaving_a_marker_pools_the_handler_for_reuse() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let near = world.spawn_marker(portal, MarkerKind::Transition, Vec3::X, MARKER_SIZE);
    let far = world.spawn_marker(portal, MarkerKind::Transition, Vec3::new(0.0, 0.0, 3.0), MARKER_SIZE);
    world.add_physics_driver(root);

    touch(&mut world, root, &[near], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let clone_root = world.handler_roots::<PhysicsCloneDriver>(root)[&near];

    world.fixed_step(0.0);
    assert!(world.handler_roots::<PhysicsCloneDriver>(root).is_empty());
    assert!(!is_active(&world.world, clone_root));
    assert_eq!(world.metrics().pooled_handlers, 1);
    assert!(world.registry().original_node(clone_root).is_none());

    touch(&mut world, root, &[far], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let roots = world.handler_roots::<PhysicsCloneDriver>(root);
    assert_eq!(roots.get(&far), Some(&clone_root));
    assert!(is_active(&world.world, clone_root));
    assert_eq!(world.registry().original_node(clone_root), Some(root));
    let metrics = world.metrics();
    assert_eq!((metrics.created, metrics.reused, metrics.retired), (1, 1, 1));
}

#[test]
fn explicit_exit_retires_on_the_same_tick() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let marker = world.spawn_marker(portal, MarkerKind::Transition, Vec3::X, MARKER_SIZE);
    world.add_physics_driver(root);

    touch(&mut world, root, &[marker], TriggerPhase::Enter);
    world.fixed_step(0.0);
    touch(&mut world, root, &[marker], TriggerPhase::Exit);
    world.fixed_step(0.0);
    assert!(world.handler_roots::<PhysicsCloneDriver>(root).is_empty());
    assert_eq!(world.metrics().retired, 1);
}

#[test]
fn reconciliation_drops_destroyed_and_inactive_volumes() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let doomed = world.spawn_marker(portal, MarkerKind::Transition, Vec3::X, MARKER_SIZE);
    let hidden = world.spawn_marker(portal, MarkerKind::Transition, Vec3::Y, MARKER_SIZE);
    world.add_physics_driver(root);

    touch(&mut world, root, &[doomed, hidden], TriggerPhase::Enter);
    world.fixed_step(0.0);
    assert_eq!(world.handler_roots::<PhysicsCloneDriver>(root).len(), 2);

    world.world.despawn(doomed);
    kestrel_portals::ecs::set_active(&mut world.world, hidden, false);
    // Stale stay callbacks still arrive for both volumes.
    touch(&mut world, root, &[doomed, hidden], TriggerPhase::Stay);
    world.fixed_step(0.0);

    assert!(world.handler_roots::<PhysicsCloneDriver>(root).is_empty());
    let occupancy = world.world.get::<TriggerOccupancy>(root).expect("occupancy component");
    assert!(occupancy.is_empty());
}

#[test]
fn child_volumes_resolve_to_their_marker() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let marker = world.spawn_marker(portal, MarkerKind::Layer, Vec3::X, MARKER_SIZE);
    let volume = world.spawn_node(Transform3D::from_translation(Vec3::Y));
    world
        .world
        .entity_mut(volume)
        .insert(CollisionVolume::trigger(ColliderShape::Box { size: MARKER_SIZE }));
    attach_child(&mut world.world, marker, volume);
    world.add_physics_driver(root);

    world.push_trigger(root, volume, root, TriggerPhase::Enter);
    world.fixed_step(0.0);
    let roots = world.handler_roots::<PhysicsCloneDriver>(root);
    assert_eq!(roots.keys().copied().collect::<Vec<_>>(), vec![marker]);
}

#[test]
fn disabling_a_driver_retires_handlers_immediately() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let markers = spawn_marker_ring(&mut world, portal);
    world.add_physics_driver(root);

    touch(&mut world, root, &markers, TriggerPhase::Enter);
    world.fixed_step(0.0);
    let clone_roots: Vec<Entity> = world.handler_roots::<PhysicsCloneDriver>(root).into_values().collect();
    assert_eq!(clone_roots.len(), 5);

    assert!(world.set_driver_enabled::<PhysicsCloneDriver>(root, false));
    assert!(world.handler_roots::<PhysicsCloneDriver>(root).is_empty());
    assert_eq!(world.metrics().active_handlers, 0);
    assert!(clone_roots.iter().all(|&clone| !is_active(&world.world, clone)));

    touch(&mut world, root, &markers, TriggerPhase::Stay);
    world.fixed_step(0.0);
    assert!(world.handler_roots::<PhysicsCloneDriver>(root).is_empty());

    assert!(world.set_driver_enabled::<PhysicsCloneDriver>(root, true));
    touch(&mut world, root, &markers, TriggerPhase::Stay);
    world.fixed_step(0.0);
    assert_eq!(world.handler_roots::<PhysicsCloneDriver>(root).len(), 5);
    assert_eq!(world.metrics().reused, 5);
    assert_eq!(world.metrics().created, 5);
}

#[test]
fn removing_a_driver_destroys_clone_trees() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let child = world.spawn_child(root, Transform3D::from_translation(Vec3::Y));
    world
        .world
        .entity_mut(child)
        .insert(CollisionVolume::new(ColliderShape::Sphere { radius: 0.25 }));
    let marker = world.spawn_marker(portal, MarkerKind::Transition, Vec3::X, MARKER_SIZE);
    world.add_physics_driver(root);

    touch(&mut world, root, &[marker], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let clone_root = world.handler_roots::<PhysicsCloneDriver>(root)[&marker];
    let clone_child = kestrel_portals::ecs::children_of(&world.world, clone_root)[0];

    assert_eq!(world.remove_driver::<PhysicsCloneDriver>(root), 1);
    assert!(world.world.get_entity(clone_root).is_err());
    assert!(world.world.get_entity(clone_child).is_err());
    assert!(world.driver::<PhysicsCloneDriver>(root).is_none());
    assert!(world.registry().is_empty());
    assert_eq!(world.metrics().pooled_handlers, 0);
}

#[test]
fn teleport_swaps_the_handler_onto_the_connected_marker() {
    let mut world = PortalWorld::new();
    let offset = Vec3::new(100.0, 0.0, 0.0);
    let portal_a = world.spawn_portal(
        Transform3D::from_translation(Vec3::new(0.0, 0.0, 2.0)),
        RigidPortal::new(glam::Mat4::from_translation(offset)),
    );
    let portal_b = world.spawn_portal(
        Transform3D::from_translation(Vec3::new(100.0, 0.0, 2.0)),
        RigidPortal::new(glam::Mat4::from_translation(-offset)),
    );
    world.link_portals(portal_a, portal_b);
    let marker_a = world.spawn_marker(portal_a, MarkerKind::Transition, Vec3::new(0.0, 0.0, 2.0), MARKER_SIZE);
    let marker_b = world.spawn_marker(portal_b, MarkerKind::Transition, Vec3::new(100.0, 0.0, 2.0), MARKER_SIZE);
    world.connect_markers(marker_a, marker_b);

    let root = spawn_tracked_root(&mut world);
    world.add_physics_driver(root);
    touch(&mut world, root, &[marker_a], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let clone_root = world.handler_roots::<PhysicsCloneDriver>(root)[&marker_a];
    assert_vec3_near(world.world_position(clone_root).expect("clone position"), offset, 1e-5);
    world.drain_events();

    assert!(world.teleport(root, portal_a));
    assert_vec3_near(world.world_position(root).expect("root position"), offset, 1e-5);
    let roots = world.handler_roots::<PhysicsCloneDriver>(root);
    assert_eq!(roots.get(&marker_b), Some(&clone_root));
    let chain = world
        .registry()
        .chain(FacetRef::pose(clone_root))
        .cloned()
        .expect("clone stays registered");
    assert_eq!(chain.portals(), &[portal_b]);

    touch(&mut world, root, &[marker_b], TriggerPhase::Stay);
    world.fixed_step(0.0);
    let roots = world.handler_roots::<PhysicsCloneDriver>(root);
    assert_eq!(roots.len(), 1);
    assert_eq!(roots.get(&marker_b), Some(&clone_root));
    assert_vec3_near(world.world_position(clone_root).expect("clone position"), Vec3::ZERO, 1e-4);

    let metrics = world.metrics();
    assert_eq!((metrics.created, metrics.retired, metrics.swapped), (1, 0, 1));

    let events = world.drain_events();
    let phases: Vec<TeleportPhase> = events
        .iter()
        .filter_map(|event| match event {
            PortalEvent::Teleported { phase, .. } => Some(*phase),
            _ => None,
        })
        .collect();
    assert_eq!(phases, vec![TeleportPhase::Pre, TeleportPhase::Post]);
    assert!(events.iter().any(|event| matches!(
        event,
        PortalEvent::HandlerSwapped { from, to, .. } if *from == marker_a && *to == marker_b
    )));
}

#[test]
fn render_driver_runs_on_the_frame_tick() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    world.world.entity_mut(root).insert(Renderer::new(vec!["stone".into()]));
    let marker = world.spawn_marker(portal, MarkerKind::Layer, Vec3::X, MARKER_SIZE);
    world.add_render_driver(root);

    touch(&mut world, root, &[marker], TriggerPhase::Enter);
    world.fixed_step(0.0);
    assert!(world.handler_roots::<RenderCloneDriver>(root).is_empty());

    world.update(1.0 / 60.0);
    let clone_root = world.handler_roots::<RenderCloneDriver>(root)[&marker];
    let renderer = world.world.get::<Renderer>(clone_root).expect("cloned renderer");
    assert_eq!(renderer.materials, vec!["stone".to_string()]);
    assert!(world.world.get::<CollisionVolume>(clone_root).is_none());
}

#[test]
fn despawned_original_takes_its_clone_trees_with_it() {
    let mut world = PortalWorld::new();
    let portal = spawn_identity_portal(&mut world);
    let root = spawn_tracked_root(&mut world);
    let child = world.spawn_child(root, Transform3D::from_translation(Vec3::Y));
    world
        .world
        .entity_mut(child)
        .insert(CollisionVolume::new(ColliderShape::Sphere { radius: 0.25 }));
    let near = world.spawn_marker(portal, MarkerKind::Transition, Vec3::X, MARKER_SIZE);
    let far = world.spawn_marker(portal, MarkerKind::Transition, Vec3::new(0.0, 0.0, 3.0), MARKER_SIZE);
    world.add_physics_driver(root);

    touch(&mut world, root, &[near, far], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let clone_roots: Vec<Entity> = world.handler_roots::<PhysicsCloneDriver>(root).into_values().collect();
    assert_eq!(clone_roots.len(), 2);
    touch(&mut world, root, &[near], TriggerPhase::Stay);
    world.fixed_step(0.0);
    assert_eq!(world.metrics().pooled_handlers, 1);

    world.world.despawn(root);
    world.fixed_step(0.0);
    for clone_root in clone_roots {
        assert!(world.world.get_entity(clone_root).is_err(), "clone tree {clone_root:?} outlived its original");
    }
    let metrics = world.metrics();
    assert_eq!((metrics.active_handlers, metrics.pooled_handlers), (0, 0));
    assert_eq!(world.world.resource::<HandlerArena>().iter().count(), 0);
    assert!(world.registry().is_empty());
}

#[test]
fn clones_of_clones_compose_both_portals() {
    let mut world = PortalWorld::new();
    let first = world.spawn_portal(
        Transform3D::default(),
        RigidPortal::new(glam::Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0))),
    );
    let second = world.spawn_portal(
        Transform3D::default(),
        RigidPortal::new(glam::Mat4::from_translation(Vec3::new(0.0, 0.0, 100.0))),
    );
    let first_marker = world.spawn_marker(first, MarkerKind::Transition, Vec3::new(0.0, 3.0, 1.0), MARKER_SIZE);
    let second_marker = world.spawn_marker(second, MarkerKind::Transition, Vec3::new(10.0, 3.0, 1.0), MARKER_SIZE);

    let root = world.spawn_node(Transform3D::from_translation(Vec3::new(0.0, 3.0, 0.0)));
    world
        .world
        .entity_mut(root)
        .insert(CollisionVolume::new(ColliderShape::Box { size: Vec3::ONE }));
    world.add_physics_driver(root);
    touch(&mut world, root, &[first_marker], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let clone = world.handler_roots::<PhysicsCloneDriver>(root)[&first_marker];
    assert_vec3_near(world.world_position(clone).expect("clone position"), Vec3::new(10.0, 3.0, 0.0), 1e-5);

    assert!(world.add_physics_driver(clone));
    touch(&mut world, root, &[first_marker], TriggerPhase::Stay);
    touch(&mut world, clone, &[second_marker], TriggerPhase::Enter);
    world.fixed_step(0.0);
    let clone_of_clone = world.handler_roots::<PhysicsCloneDriver>(clone)[&second_marker];
    assert_vec3_near(
        world.world_position(clone_of_clone).expect("clone of clone position"),
        Vec3::new(10.0, 3.0, 100.0),
        1e-4,
    );
    let (origin, chain) = world.registry().resolve_root(FacetRef::pose(clone_of_clone)).expect("chained clone");
    assert_eq!(origin, FacetRef::pose(root));
    assert_eq!(chain.portals(), &[first, second]);

    world.world.get_mut::<Transform3D>(root).expect("root transform").translation.x = 1.0;
    touch(&mut world, root, &[first_marker], TriggerPhase::Stay);
    touch(&mut world, clone, &[second_marker], TriggerPhase::Stay);
    world.fixed_step(0.0);
    assert_vec3_near(world.world_position(clone).expect("clone position"), Vec3::new(11.0, 3.0, 0.0), 1e-4);
    assert_vec3_near(
        world.world_position(clone_of_clone).expect("clone of clone position"),
        Vec3::new(11.0, 3.0, 100.0),
        1e-4,
    );
}
