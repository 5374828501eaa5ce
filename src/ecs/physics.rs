use super::{is_active_in_hierarchy, set_world_matrix, world_matrix, PhysicsBody, TimeDelta};
use crate::ecs::profiler::profile_exclusive;
use bevy_ecs::prelude::*;
use glam::{Mat4, Quat, Vec3};

#[derive(Resource, Clone, Copy, Debug, PartialEq)]
pub struct PhysicsParams {
    pub gravity: Vec3,
}

impl Default for PhysicsParams {
    fn default() -> Self {
        Self { gravity: Vec3::new(0.0, -9.81, 0.0) }
    }
}

/// Advances every active body by one fixed step and writes the resulting pose back to
/// the owning node. Kinematic bodies only follow their queued move target.
pub fn sys_integrate_bodies(world: &mut World) {
    profile_exclusive(world, "sys_integrate_bodies", |world| {
        let dt = world.get_resource::<TimeDelta>().map_or(0.0, |dt| dt.0);
        if dt <= 0.0 {
            return;
        }
        let gravity = world.get_resource::<PhysicsParams>().copied().unwrap_or_default().gravity;
        let mut bodies = world.query_filtered::<Entity, With<PhysicsBody>>();
        let entities: Vec<Entity> = bodies.iter(world).collect();
        for entity in entities {
            if !is_active_in_hierarchy(world, entity) {
                continue;
            }
            let Some(pose) = world.get_mut::<PhysicsBody>(entity).map(|mut body| step_body(&mut body, gravity, dt))
            else {
                continue;
            };
            let scale = world_matrix(world, entity).map_or(Vec3::ONE, |m| m.to_scale_rotation_translation().0);
            set_world_matrix(world, entity, pose * Mat4::from_scale(scale));
        }
    });
}

fn step_body(body: &mut PhysicsBody, gravity: Vec3, dt: f32) -> Mat4 {
    body.previous_position = body.position;
    body.previous_rotation = body.rotation;
    if body.kinematic {
        if let Some((position, rotation)) = body.take_move_target() {
            body.position = position;
            body.rotation = rotation;
        }
        return body.pose_matrix();
    }
    if body.mass > 0.0 && body.use_gravity {
        body.linear_velocity += gravity * dt;
    }
    body.linear_velocity *= 1.0 / (1.0 + body.drag * dt);
    body.angular_velocity *= 1.0 / (1.0 + body.angular_drag * dt);
    body.position += body.linear_velocity * dt;
    body.rotation = (Quat::from_scaled_axis(body.angular_velocity * dt) * body.rotation).normalize();
    body.pose_matrix()
}
