//! Mesh data structures and generation

use crate::backend::traits::*;
use crate::backend::types::{MeshDescriptor, QuadVertex, Vertex, VertexBufferLayout};
use glam::{Vec2, Vec3};
use std::sync::Arc;

/// CPU-side geometry ready for upload
#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub vertices: Vec<u8>,
    pub vertex_count: usize,
    pub layout: VertexBufferLayout,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn from_vertices(name: &str, vertices: &[Vertex], indices: Vec<u32>) -> Self {
        Self {
            name: name.to_string(),
            vertices: bytemuck::cast_slice(vertices).to_vec(),
            vertex_count: vertices.len(),
            layout: Vertex::layout(),
            indices,
        }
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    /// Two triangles covering clip space, UVs from 0 to 1
    pub fn fullscreen_quad() -> Self {
        let vertices = [
            QuadVertex {
                position: Vec2::new(-1.0, -1.0),
                uv: Vec2::new(0.0, 0.0),
            },
            QuadVertex {
                position: Vec2::new(1.0, -1.0),
                uv: Vec2::new(1.0, 0.0),
            },
            QuadVertex {
                position: Vec2::new(1.0, 1.0),
                uv: Vec2::new(1.0, 1.0),
            },
            QuadVertex {
                position: Vec2::new(-1.0, 1.0),
                uv: Vec2::new(0.0, 1.0),
            },
        ];
        Self {
            name: "fullscreen_quad".to_string(),
            vertices: bytemuck::cast_slice(&vertices).to_vec(),
            vertex_count: vertices.len(),
            layout: QuadVertex::layout(),
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    /// Unit cube centered at origin
    pub fn cube() -> Self {
        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, right, up) in faces {
            let base = vertices.len() as u32;
            for (u, v) in [(0.0, 0.0), (1.0, 0.0), (1.0, 1.0), (0.0, 1.0)] {
                let position = normal * 0.5 + right * (u - 0.5) + up * (v - 0.5);
                vertices.push(Vertex::new(position, normal, Vec2::new(u, 1.0 - v)));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        Self::from_vertices("cube", &vertices, indices)
    }

    /// UV sphere of diameter 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let segments = segments.max(3);
        let rings = rings.max(2);
        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        let mut vertices = Vec::new();
        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let normal = Vec3::new(ring_radius * theta.cos(), y, ring_radius * theta.sin());
                let uv = Vec2::new(
                    segment as f32 / segments as f32,
                    ring as f32 / rings as f32,
                );
                vertices.push(Vertex::new(normal * 0.5, normal.normalize_or_zero(), uv));
            }
        }

        let mut indices = Vec::new();
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }

        Self::from_vertices("sphere", &vertices, indices)
    }

    /// Plane on the XZ axis facing up
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let subdivisions = subdivisions.max(1);
        let half_width = width / 2.0;
        let half_depth = depth / 2.0;
        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        let mut vertices = Vec::new();
        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                let position = Vec3::new(
                    -half_width + x as f32 * step_x,
                    0.0,
                    -half_depth + z as f32 * step_z,
                );
                let uv = Vec2::new(
                    x as f32 / subdivisions as f32,
                    z as f32 / subdivisions as f32,
                );
                vertices.push(Vertex::new(position, Vec3::Y, uv));
            }
        }

        let mut indices = Vec::new();
        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        Self::from_vertices("plane", &vertices, indices)
    }
}

/// Geometry uploaded to the backend
#[derive(Debug)]
pub struct Mesh {
    name: String,
    handle: MeshHandle,
    index_count: usize,
}

impl Mesh {
    pub fn upload(backend: &mut dyn GraphicsBackend, data: &MeshData) -> BackendResult<Arc<Self>> {
        let handle = backend.create_mesh(&MeshDescriptor {
            label: &data.name,
            vertices: &data.vertices,
            layout: &data.layout,
            indices: &data.indices,
        })?;
        Ok(Arc::new(Self {
            name: data.name.clone(),
            handle,
            index_count: data.indices.len(),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> MeshHandle {
        self.handle
    }

    pub fn index_count(&self) -> usize {
        self.index_count
    }

    pub fn draw(&self, backend: &mut dyn GraphicsBackend) {
        backend.draw_mesh(self.handle);
    }

    pub fn destroy(&self, backend: &mut dyn GraphicsBackend) {
        backend.destroy_mesh(self.handle);
    }
}
