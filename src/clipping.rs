//! Geometry clipping service.
//!
//! Cuts collision geometry against one or more planes, keeping the part on the front
//! (normal) side of every plane. Polygons are clipped one plane at a time and
//! re-triangulated as fans; no cross-section caps are generated.

use bevy_ecs::prelude::Resource;
use glam::{Mat4, Vec3};
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ColliderMesh {
    pub vertices: Vec<Vec3>,
    pub normals: Vec<Vec3>,
    /// Triangle index lists, one per submesh.
    pub submeshes: Vec<Vec<u32>>,
}

impl ColliderMesh {
    /// Axis-aligned box centred on the origin, 12 triangles with flat normals.
    pub fn cuboid(size: Vec3) -> Self {
        let h = size * 0.5;
        let faces: [(Vec3, Vec3, Vec3); 6] = [
            (Vec3::X, Vec3::Y, Vec3::Z),
            (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
            (Vec3::Y, Vec3::Z, Vec3::X),
            (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
            (Vec3::Z, Vec3::X, Vec3::Y),
            (Vec3::NEG_Z, Vec3::X, Vec3::NEG_Y),
        ];
        let mut mesh = ColliderMesh { submeshes: vec![Vec::with_capacity(36)], ..Default::default() };
        for (normal, u, v) in faces {
            let center = normal * h;
            let du = u * h;
            let dv = v * h;
            let base = mesh.vertices.len() as u32;
            for corner in [center - du - dv, center + du - dv, center + du + dv, center - du + dv] {
                mesh.vertices.push(corner);
                mesh.normals.push(normal);
            }
            mesh.submeshes[0].extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    pub fn translated(&self, offset: Vec3) -> Self {
        if offset == Vec3::ZERO {
            return self.clone();
        }
        Self {
            vertices: self.vertices.iter().map(|v| *v + offset).collect(),
            normals: self.normals.clone(),
            submeshes: self.submeshes.clone(),
        }
    }

    pub fn transformed(&self, matrix: Mat4) -> Self {
        Self {
            vertices: self.vertices.iter().map(|v| matrix.transform_point3(*v)).collect(),
            normals: self.normals.iter().map(|n| matrix.transform_vector3(*n).normalize_or_zero()).collect(),
            submeshes: self.submeshes.clone(),
        }
    }

    pub fn triangle_count(&self) -> usize {
        self.submeshes.iter().map(|indices| indices.len() / 3).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.triangle_count() == 0
    }

    pub fn bounds(&self) -> Option<(Vec3, Vec3)> {
        let first = *self.vertices.first()?;
        Some(self.vertices.iter().fold((first, first), |(min, max), v| (min.min(*v), max.max(*v))))
    }

    fn normal_at(&self, index: usize, fallback: Vec3) -> Vec3 {
        self.normals.get(index).copied().unwrap_or(fallback)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CuttingPlane {
    pub point: Vec3,
    pub normal: Vec3,
}

impl CuttingPlane {
    pub fn new(point: Vec3, normal: Vec3) -> Self {
        Self { point, normal: normal.normalize_or_zero() }
    }

    /// Positive in front, negative behind.
    pub fn signed_distance(&self, point: Vec3) -> f32 {
        (point - self.point).dot(self.normal)
    }

    pub fn flipped(&self) -> Self {
        Self { point: self.point, normal: -self.normal }
    }

    pub fn transformed(&self, matrix: Mat4) -> Self {
        let normal_matrix = matrix.inverse().transpose();
        Self::new(matrix.transform_point3(self.point), normal_matrix.transform_vector3(self.normal))
    }

    pub fn approx_eq(&self, other: &CuttingPlane, tolerance: f32) -> bool {
        self.point.distance(other.point) <= tolerance && self.normal.dot(other.normal) >= 1.0 - tolerance
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SliceOutput {
    pub mesh: ColliderMesh,
    pub has_remaining_geometry: bool,
}

pub trait GeometryClipper: Send + Sync {
    fn slice(&self, mesh: &ColliderMesh, planes: &[CuttingPlane]) -> SliceOutput;
}

#[derive(Clone, Copy, Debug)]
pub struct PlaneClipper {
    pub epsilon: f32,
}

impl Default for PlaneClipper {
    fn default() -> Self {
        Self { epsilon: 1e-5 }
    }
}

#[derive(Clone, Copy)]
struct ClipVertex {
    position: Vec3,
    normal: Vec3,
}

type Polygon = SmallVec<[ClipVertex; 8]>;

impl PlaneClipper {
    /// Geometry flush with a cutting plane has no extent on the kept side and counts as
    /// nothing left.
    fn has_depth(&self, mesh: &ColliderMesh, planes: &[CuttingPlane]) -> bool {
        planes.iter().all(|plane| mesh.vertices.iter().any(|v| plane.signed_distance(*v) > self.epsilon))
    }

    fn clip_polygon(&self, polygon: &Polygon, plane: &CuttingPlane) -> Polygon {
        let mut out = Polygon::new();
        let count = polygon.len();
        for i in 0..count {
            let current = polygon[i];
            let next = polygon[(i + 1) % count];
            let d_current = plane.signed_distance(current.position);
            let d_next = plane.signed_distance(next.position);
            let current_in = d_current >= -self.epsilon;
            let next_in = d_next >= -self.epsilon;
            if current_in {
                out.push(current);
            }
            if current_in != next_in {
                let t = d_current / (d_current - d_next);
                out.push(ClipVertex {
                    position: current.position.lerp(next.position, t),
                    normal: current.normal.lerp(next.normal, t).normalize_or_zero(),
                });
            }
        }
        out
    }
}

impl GeometryClipper for PlaneClipper {
    fn slice(&self, mesh: &ColliderMesh, planes: &[CuttingPlane]) -> SliceOutput {
        let mut result = ColliderMesh { submeshes: Vec::with_capacity(mesh.submeshes.len()), ..Default::default() };
        for indices in &mesh.submeshes {
            let mut out_indices = Vec::with_capacity(indices.len());
            for tri in indices.chunks_exact(3) {
                let corners = [tri[0] as usize, tri[1] as usize, tri[2] as usize];
                if corners.iter().any(|&i| i >= mesh.vertices.len()) {
                    continue;
                }
                let [a, b, c] = corners.map(|i| mesh.vertices[i]);
                let face_normal = (b - a).cross(c - a).normalize_or_zero();
                let mut polygon: Polygon = corners
                    .iter()
                    .map(|&i| ClipVertex { position: mesh.vertices[i], normal: mesh.normal_at(i, face_normal) })
                    .collect();
                for plane in planes {
                    polygon = self.clip_polygon(&polygon, plane);
                    if polygon.len() < 3 {
                        break;
                    }
                }
                if polygon.len() < 3 {
                    continue;
                }
                let base = result.vertices.len() as u32;
                for vertex in &polygon {
                    result.vertices.push(vertex.position);
                    result.normals.push(vertex.normal);
                }
                for k in 1..(polygon.len() as u32 - 1) {
                    out_indices.extend_from_slice(&[base, base + k, base + k + 1]);
                }
            }
            result.submeshes.push(out_indices);
        }
        let has_remaining_geometry = !result.is_empty() && self.has_depth(&result, planes);
        SliceOutput { mesh: result, has_remaining_geometry }
    }
}

#[derive(Resource, Clone)]
pub struct ClippingService(pub Arc<dyn GeometryClipper>);

impl Default for ClippingService {
    fn default() -> Self {
        Self(Arc::new(PlaneClipper::default()))
    }
}

impl ClippingService {
    pub fn slice(&self, mesh: &ColliderMesh, planes: &[CuttingPlane]) -> SliceOutput {
        self.0.slice(mesh, planes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_triangle() -> ColliderMesh {
        ColliderMesh {
            vertices: vec![Vec3::new(-1.0, 0.0, 0.0), Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, 2.0, 0.0)],
            normals: vec![Vec3::Z; 3],
            submeshes: vec![vec![0, 1, 2]],
        }
    }

    #[test]
    fn triangle_entirely_in_front_is_kept() {
        let plane = CuttingPlane::new(Vec3::new(0.0, -1.0, 0.0), Vec3::Y);
        let out = PlaneClipper::default().slice(&single_triangle(), &[plane]);
        assert!(out.has_remaining_geometry);
        assert_eq!(out.mesh.triangle_count(), 1);
    }

    #[test]
    fn triangle_entirely_behind_reports_no_geometry() {
        let plane = CuttingPlane::new(Vec3::new(0.0, 5.0, 0.0), Vec3::Y);
        let out = PlaneClipper::default().slice(&single_triangle(), &[plane]);
        assert!(!out.has_remaining_geometry);
        assert!(out.mesh.is_empty());
    }

    #[test]
    fn face_flush_with_the_plane_is_not_geometry() {
        let cube = ColliderMesh::cuboid(Vec3::splat(2.0));
        let plane = CuttingPlane::new(Vec3::new(0.0, 0.0, 1.0), Vec3::Z);
        let clipper = PlaneClipper::default();
        assert!(!clipper.slice(&cube, &[plane]).has_remaining_geometry);
        let behind = clipper.slice(&cube, &[plane.flipped()]);
        assert!(behind.has_remaining_geometry);
        assert_eq!(behind.mesh.bounds(), Some((Vec3::splat(-1.0), Vec3::splat(1.0))));
    }

    #[test]
    fn split_keeps_only_front_vertices() {
        let plane = CuttingPlane::new(Vec3::new(0.0, 1.0, 0.0), Vec3::Y);
        let out = PlaneClipper::default().slice(&single_triangle(), &[plane]);
        assert_eq!(out.mesh.triangle_count(), 1);
        for v in &out.mesh.vertices {
            assert!(v.y >= 1.0 - 1e-4, "vertex {v:?} behind plane");
        }
    }

    #[test]
    fn two_front_vertices_produce_quad() {
        let plane = CuttingPlane::new(Vec3::new(0.0, 1.0, 0.0), Vec3::NEG_Y);
        let out = PlaneClipper::default().slice(&single_triangle(), &[plane]);
        assert_eq!(out.mesh.triangle_count(), 2);
        assert_eq!(out.mesh.normals.len(), out.mesh.vertices.len());
    }

    #[test]
    fn cuboid_halves_by_opposite_planes() {
        let cube = ColliderMesh::cuboid(Vec3::splat(2.0));
        assert_eq!(cube.triangle_count(), 12);
        let plane = CuttingPlane::new(Vec3::ZERO, Vec3::X);
        let clipper = PlaneClipper::default();
        let front = clipper.slice(&cube, &[plane]);
        let back = clipper.slice(&cube, &[plane.flipped()]);
        let (front_min, front_max) = front.mesh.bounds().expect("front bounds");
        let (back_min, back_max) = back.mesh.bounds().expect("back bounds");
        assert!(front_min.x >= -1e-4 && (front_max.x - 1.0).abs() < 1e-4);
        assert!((back_min.x + 1.0).abs() < 1e-4 && back_max.x <= 1e-4);
    }

    #[test]
    fn plane_transform_preserves_signed_distance() {
        let plane = CuttingPlane::new(Vec3::new(0.0, 0.0, 2.0), Vec3::Z);
        let matrix = Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0)) * Mat4::from_rotation_y(0.5);
        let moved = plane.transformed(matrix);
        let sample = Vec3::new(0.2, 0.4, 3.0);
        let expected = plane.signed_distance(sample);
        let actual = moved.signed_distance(matrix.transform_point3(sample));
        assert!((expected - actual).abs() < 1e-4);
    }
}
