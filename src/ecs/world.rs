use super::*;
use crate::clipping::{ClippingService, GeometryClipper};
use crate::cloning::driver::{
    handler_roots, remove_driver, set_driver_enabled, swap_on_teleport, sys_admit_handlers, sys_rank_candidates,
    sys_sync_clones,
};
use crate::cloning::occupancy::sys_reconcile_trigger_occupancy;
use crate::cloning::static_driver::{remove_static_driver, set_static_enabled, sys_update_static_clones};
use crate::cloning::{
    CloneDriver, CloneMetrics, CloneRegistry, DriverSettings, HandlerArena, PhysicsCloneDriver, RenderCloneDriver,
    StaticCloneDriver, TriggerContact, TriggerContacts, TriggerKey, TriggerOccupancy, TriggerPhase,
};
use crate::config::{check_clone_cap, ConfigError, PortalConfig};
use crate::events::{EventBus, PortalEvent, TeleportPhase};
use crate::portal::{Portal, PortalSpace};
use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3};
use std::collections::BTreeMap;
use std::sync::Arc;

// ---------- World container ----------
pub struct PortalWorld {
    pub world: World,
    schedule_fixed: Schedule,
    schedule_frame: Schedule,
    config: PortalConfig,
}

impl Default for PortalWorld {
    fn default() -> Self {
        Self::new()
    }
}

impl PortalWorld {
    pub fn new() -> Self {
        Self::build(PortalConfig::default())
    }

    pub fn with_config(config: PortalConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        config.warn_suspicious();
        Ok(Self::build(config))
    }

    fn build(config: PortalConfig) -> Self {
        let mut world = World::new();
        world.insert_resource(TimeDelta(0.0));
        world.insert_resource(PhysicsParams { gravity: config.physics.gravity() });
        world.insert_resource(CloneRegistry::new());
        world.insert_resource(HandlerArena::default());
        world.insert_resource(TriggerContacts::default());
        world.insert_resource(CloneMetrics::default());
        world.insert_resource(ClippingService::default());
        world.insert_resource(EventBus::default());
        world.insert_resource(SystemProfiler::new());

        let mut schedule_fixed = Schedule::default();
        schedule_fixed.add_systems(
            (
                sys_reconcile_trigger_occupancy,
                sys_rank_candidates::<PhysicsCloneDriver>,
                sys_admit_handlers::<PhysicsCloneDriver>,
                sys_integrate_bodies,
                sys_sync_clones::<PhysicsCloneDriver>,
                sys_update_static_clones,
            )
                .chain(),
        );

        let mut schedule_frame = Schedule::default();
        schedule_frame.add_systems(
            (
                sys_rank_candidates::<RenderCloneDriver>,
                sys_admit_handlers::<RenderCloneDriver>,
                sys_sync_clones::<RenderCloneDriver>,
            )
                .chain(),
        );

        Self { world, schedule_fixed, schedule_frame, config }
    }

    pub fn config(&self) -> &PortalConfig {
        &self.config
    }

    /// Fixed simulation tick: trigger reconciliation, physics clones, body integration
    /// and static colliders.
    pub fn fixed_step(&mut self, dt: f32) {
        self.world.resource_mut::<TimeDelta>().0 = dt;
        self.world.resource_mut::<SystemProfiler>().begin_tick(TickKind::Fixed);
        self.schedule_fixed.run(&mut self.world);
    }

    /// Frame tick: render clones only.
    pub fn update(&mut self, dt: f32) {
        self.world.resource_mut::<TimeDelta>().0 = dt;
        self.world.resource_mut::<SystemProfiler>().begin_tick(TickKind::Frame);
        self.schedule_frame.run(&mut self.world);
    }

    pub fn set_clipper(&mut self, clipper: Arc<dyn GeometryClipper>) {
        self.world.insert_resource(ClippingService(clipper));
    }

    // ---------- Scene construction ----------

    pub fn spawn_node(&mut self, transform: Transform3D) -> Entity {
        self.world.spawn(transform).id()
    }

    pub fn spawn_child(&mut self, parent: Entity, transform: Transform3D) -> Entity {
        let child = self.spawn_node(transform);
        attach_child(&mut self.world, parent, child);
        child
    }

    pub fn spawn_portal(&mut self, transform: Transform3D, space: impl PortalSpace + 'static) -> Entity {
        let portal = self.spawn_node(transform);
        self.world.entity_mut(portal).insert(Portal::new(space));
        portal
    }

    pub fn link_portals(&mut self, a: Entity, b: Entity) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(mut portal) = self.world.get_mut::<Portal>(from) {
                portal.connected = Some(to);
            }
        }
    }

    /// Trigger volume marking the approach to `portal`.
    pub fn spawn_marker(&mut self, portal: Entity, kind: MarkerKind, position: Vec3, size: Vec3) -> Entity {
        let marker = self.spawn_node(Transform3D::from_translation(position));
        self.world.entity_mut(marker).insert((
            PortalMarker { portal, kind, connected: None },
            CollisionVolume::trigger(ColliderShape::Box { size }),
        ));
        marker
    }

    pub fn connect_markers(&mut self, a: Entity, b: Entity) {
        for (from, to) in [(a, b), (b, a)] {
            if let Some(mut marker) = self.world.get_mut::<PortalMarker>(from) {
                marker.connected = Some(to);
            }
        }
    }

    /// Adds a body whose pose starts at the node's current world pose.
    pub fn attach_body(&mut self, entity: Entity, body: PhysicsBody) -> bool {
        let Some(matrix) = world_matrix(&self.world, entity) else {
            return false;
        };
        let (_, rotation, translation) = matrix.to_scale_rotation_translation();
        self.world.entity_mut(entity).insert(body.at(translation, rotation.normalize()));
        true
    }

    // ---------- Drivers ----------

    pub fn add_physics_driver(&mut self, root: Entity) -> bool {
        let settings = self.config.cloning.physics_settings();
        self.add_driver::<PhysicsCloneDriver>(root, settings)
    }

    pub fn add_render_driver(&mut self, root: Entity) -> bool {
        let settings = self.config.cloning.render_settings();
        self.add_driver::<RenderCloneDriver>(root, settings)
    }

    /// Attaches driver `D` to `root`. Settings with a cap below -1 are rejected.
    pub fn add_driver<D: CloneDriver>(&mut self, root: Entity, settings: DriverSettings) -> bool {
        if let Err(err) = check_clone_cap(D::NAME, settings.max_clones) {
            tracing::warn!(?root, "driver not added: {err}");
            return false;
        }
        let Ok(mut entity) = self.world.get_entity_mut(root) else {
            return false;
        };
        if !entity.contains::<TriggerOccupancy>() {
            entity.insert(TriggerOccupancy::default());
        }
        entity.insert(D::from_settings(settings));
        true
    }

    pub fn driver<D: CloneDriver>(&self, root: Entity) -> Option<&D> {
        self.world.get::<D>(root)
    }

    /// Changes the clone cap of a live driver; takes effect on its next ranking pass.
    /// Caps below -1 are rejected and leave the driver unchanged.
    pub fn set_max_clones<D: CloneDriver>(&mut self, root: Entity, max_clones: i32) -> bool {
        if let Err(err) = check_clone_cap(D::NAME, max_clones) {
            tracing::warn!(?root, "clone cap unchanged: {err}");
            return false;
        }
        match self.world.get_mut::<D>(root) {
            Some(mut driver) => {
                driver.state_mut().settings.max_clones = max_clones;
                true
            }
            None => false,
        }
    }

    pub fn set_driver_enabled<D: CloneDriver>(&mut self, root: Entity, enabled: bool) -> bool {
        set_driver_enabled::<D>(&mut self.world, root, enabled)
    }

    pub fn remove_driver<D: CloneDriver>(&mut self, root: Entity) -> usize {
        remove_driver::<D>(&mut self.world, root)
    }

    pub fn handler_roots<D: CloneDriver>(&self, root: Entity) -> BTreeMap<Entity, Entity> {
        handler_roots::<D>(&self.world, root)
    }

    pub fn add_static_driver(&mut self, original: Entity, portal: Entity) -> bool {
        let cfg = &self.config.static_colliders;
        let driver = StaticCloneDriver::new(portal)
            .with_recompute(cfg.recompute)
            .with_plane_tolerance(cfg.plane_tolerance)
            .with_disable_original(cfg.disable_original);
        self.insert_static_driver(original, driver)
    }

    pub fn insert_static_driver(&mut self, original: Entity, driver: StaticCloneDriver) -> bool {
        if self.world.get::<CollisionVolume>(original).is_none() {
            return false;
        }
        self.world.entity_mut(original).insert(driver);
        true
    }

    pub fn static_driver(&self, original: Entity) -> Option<&StaticCloneDriver> {
        self.world.get::<StaticCloneDriver>(original)
    }

    pub fn set_static_driver_enabled(&mut self, original: Entity, enabled: bool) -> bool {
        set_static_enabled(&mut self.world, original, enabled)
    }

    pub fn remove_static_driver(&mut self, original: Entity) -> bool {
        remove_static_driver(&mut self.world, original)
    }

    pub fn request_static_recompute(&mut self, original: Entity) -> bool {
        match self.world.get_mut::<StaticCloneDriver>(original) {
            Some(mut driver) => {
                driver.request_recompute();
                true
            }
            None => false,
        }
    }

    // ---------- Triggers & teleports ----------

    pub fn push_trigger(&mut self, owner: Entity, volume: Entity, source: Entity, phase: TriggerPhase) {
        self.world.resource_mut::<TriggerContacts>().push(TriggerContact {
            owner,
            key: TriggerKey { volume, source },
            phase,
        });
    }

    /// Moves `node` through `portal`, emitting the pre/post notifications and swapping
    /// any handler that was watching that portal.
    pub fn teleport(&mut self, node: Entity, portal: Entity) -> bool {
        let Some(space) = self.world.get::<Portal>(portal).map(|portal| Arc::clone(&portal.space)) else {
            return false;
        };
        let Some(mut matrix) = world_matrix(&self.world, node) else {
            return false;
        };
        self.emit(PortalEvent::Teleported { node, portal, phase: TeleportPhase::Pre });
        space.modify_matrix(&mut matrix);
        set_world_matrix(&mut self.world, node, matrix);
        if let Some(mut body) = self.world.get_mut::<PhysicsBody>(node) {
            let mut pose: Mat4 = body.pose_matrix();
            space.modify_matrix(&mut pose);
            let (_, rotation, translation) = pose.to_scale_rotation_translation();
            body.teleport(translation, rotation.normalize());
            space.modify_vector(&mut body.linear_velocity);
            space.modify_vector(&mut body.angular_velocity);
        }
        self.emit(PortalEvent::Teleported { node, portal, phase: TeleportPhase::Post });
        self.notify_teleported(node, portal);
        true
    }

    /// Post-teleport hook for hosts that relocate nodes themselves.
    pub fn notify_teleported(&mut self, node: Entity, portal: Entity) -> usize {
        swap_on_teleport::<PhysicsCloneDriver>(&mut self.world, node, portal)
            + swap_on_teleport::<RenderCloneDriver>(&mut self.world, node, portal)
    }

    // ---------- Diagnostics ----------

    pub fn registry(&self) -> &CloneRegistry {
        self.world.resource::<CloneRegistry>()
    }

    pub fn metrics(&self) -> CloneMetrics {
        *self.world.resource::<CloneMetrics>()
    }

    pub fn profiler(&self) -> &SystemProfiler {
        self.world.resource::<SystemProfiler>()
    }

    fn emit(&mut self, event: PortalEvent) {
        self.world.resource_mut::<EventBus>().push(event);
    }

    pub fn drain_events(&mut self) -> Vec<PortalEvent> {
        self.world.resource_mut::<EventBus>().drain()
    }

    pub fn world_position(&self, entity: Entity) -> Option<Vec3> {
        world_matrix(&self.world, entity).map(|matrix| matrix.w_axis.truncate())
    }
}
