//! Read-only per-frame snapshot of the scene
//!
//! Stages never query the ECS world directly. [`SceneView::extract`] copies what they
//! need once per frame, already sorted, and the only write-back (camera buffer swaps)
//! is collected here and committed with [`SceneView::apply_swaps`].

use crate::render_target::SharedRenderTarget;
use crate::resources::{Material, Mesh};
use crate::scene::{Camera, PointLight, Renderable, ShadowLight, Transform};
use bevy_ecs::prelude::*;
use glam::{Mat4, Vec3, Vec4};
use parking_lot::Mutex;
use std::sync::Arc;

/// Extracted camera
#[derive(Clone)]
pub struct CameraView {
    pub entity: Entity,
    pub is_main: bool,
    pub back_buffer: SharedRenderTarget,
    pub front_buffer: Option<SharedRenderTarget>,
    pub clear_color: Vec4,
    pub projection: Mat4,
    pub world: Mat4,
}

impl CameraView {
    pub fn view(&self) -> Mat4 {
        self.world.inverse()
    }

    pub fn position(&self) -> Vec3 {
        self.world.w_axis.truncate()
    }
}

/// Extracted renderable with its world matrix
#[derive(Clone)]
pub struct DrawItem {
    pub entity: Entity,
    pub mesh: Option<Arc<Mesh>>,
    pub material: Option<Arc<Material>>,
    pub casts_shadows: bool,
    pub world: Mat4,
}

impl DrawItem {
    /// Mesh and material, when both are present
    pub fn drawable(&self) -> Option<(&Arc<Mesh>, &Arc<Material>)> {
        Some((self.mesh.as_ref()?, self.material.as_ref()?))
    }

    fn sort_key(&self) -> (bool, bool, usize, usize) {
        match self.drawable() {
            None => (false, false, 0, 0),
            Some((_, material)) => (
                true,
                material.is_blended(),
                Arc::as_ptr(material.shader()) as usize,
                Arc::as_ptr(material) as usize,
            ),
        }
    }
}

#[derive(Clone)]
pub struct ShadowLightView {
    pub entity: Entity,
    pub light: ShadowLight,
    pub world: Mat4,
}

#[derive(Debug, Clone, Copy)]
pub struct PointLightView {
    pub entity: Entity,
    pub light: PointLight,
    pub world: Mat4,
}

impl PointLightView {
    pub fn position(&self) -> Vec3 {
        self.world.w_axis.truncate()
    }
}

/// Everything the stages read during one frame
#[derive(Default)]
pub struct SceneView {
    /// Main camera last
    pub cameras: Vec<CameraView>,
    /// Undrawable first, then opaque before blended, grouped by shader then material
    pub renderables: Vec<DrawItem>,
    pub shadow_lights: Vec<ShadowLightView>,
    pub point_lights: Vec<PointLightView>,
    swaps: Mutex<Vec<Entity>>,
}

impl SceneView {
    pub fn extract(world: &mut World) -> Self {
        let mut cameras: Vec<_> = world
            .query::<(Entity, &Camera, Option<&Transform>)>()
            .iter(world)
            .map(|(entity, camera, transform)| CameraView {
                entity,
                is_main: camera.is_main,
                back_buffer: camera.back_buffer.clone(),
                front_buffer: camera.front_buffer.clone(),
                clear_color: camera.clear_color,
                projection: camera.projection,
                world: world_matrix(transform),
            })
            .collect();
        cameras.sort_by_key(|camera| camera.is_main);

        let mut renderables: Vec<_> = world
            .query::<(Entity, &Renderable, Option<&Transform>)>()
            .iter(world)
            .map(|(entity, renderable, transform)| DrawItem {
                entity,
                mesh: renderable.mesh.clone(),
                material: renderable.material.clone(),
                casts_shadows: renderable.casts_shadows,
                world: world_matrix(transform),
            })
            .collect();
        renderables.sort_by_key(DrawItem::sort_key);

        let shadow_lights = world
            .query::<(Entity, &ShadowLight, Option<&Transform>)>()
            .iter(world)
            .map(|(entity, light, transform)| ShadowLightView {
                entity,
                light: light.clone(),
                world: world_matrix(transform),
            })
            .collect();

        let point_lights = world
            .query::<(Entity, &PointLight, Option<&Transform>)>()
            .iter(world)
            .map(|(entity, light, transform)| PointLightView {
                entity,
                light: *light,
                world: world_matrix(transform),
            })
            .collect();

        Self {
            cameras,
            renderables,
            shadow_lights,
            point_lights,
            swaps: Mutex::new(Vec::new()),
        }
    }

    pub fn main_camera(&self) -> Option<&CameraView> {
        self.cameras.iter().rev().find(|camera| camera.is_main)
    }

    /// Renderables with both a mesh and a material, in draw order
    pub fn drawables(&self) -> impl Iterator<Item = (&DrawItem, &Arc<Mesh>, &Arc<Material>)> {
        self.renderables
            .iter()
            .filter_map(|item| item.drawable().map(|(mesh, material)| (item, mesh, material)))
    }

    /// Queue a front/back swap for a double-buffered camera
    pub fn record_swap(&self, camera: Entity) {
        self.swaps.lock().push(camera);
    }

    pub fn pending_swaps(&self) -> Vec<Entity> {
        self.swaps.lock().clone()
    }

    /// Commit queued camera swaps to the world
    pub fn apply_swaps(&self, world: &mut World) {
        for entity in self.swaps.lock().drain(..) {
            if let Some(mut camera) = world.get_mut::<Camera>(entity) {
                camera.swap_buffers();
            }
        }
    }
}

fn world_matrix(transform: Option<&Transform>) -> Mat4 {
    transform.map(Transform::matrix).unwrap_or(Mat4::IDENTITY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BlendState, HeadlessBackend};
    use crate::resources::{MeshData, Shader};
    use crate::scene::create_gbuffer_target;

    #[test]
    fn test_renderables_sorted_for_batching() {
        let mut backend = HeadlessBackend::default();
        let mesh = Mesh::upload(&mut backend, &MeshData::cube()).unwrap();
        let shader = Shader::new(&mut backend, "lit", "fn vs_main() {}").unwrap();
        let opaque = Arc::new(Material::new("opaque", shader.clone()));
        let blended =
            Arc::new(Material::new("glass", shader.clone()).with_blend(BlendState::alpha_blending()));

        let mut world = World::new();
        let glass = world.spawn(Renderable::new(mesh.clone(), blended)).id();
        let solid = world.spawn(Renderable::new(mesh.clone(), opaque)).id();
        let empty = world.spawn(Renderable::default()).id();

        let view = SceneView::extract(&mut world);
        let order: Vec<_> = view.renderables.iter().map(|item| item.entity).collect();
        assert_eq!(order, vec![empty, solid, glass]);
        assert_eq!(view.drawables().count(), 2);
    }

    #[test]
    fn test_main_camera_last_and_swaps_applied() {
        let mut backend = HeadlessBackend::default();
        let mut world = World::new();
        let main_back = create_gbuffer_target(&mut backend, 8, 8, 1).unwrap().shared();
        let main = world
            .spawn((
                Camera::main(main_back.clone(), Mat4::IDENTITY)
                    .double_buffered(&mut backend)
                    .unwrap(),
                Transform::default(),
            ))
            .id();
        let side_back = create_gbuffer_target(&mut backend, 8, 8, 1).unwrap().shared();
        world.spawn(Camera::new(side_back, Mat4::IDENTITY));

        let view = SceneView::extract(&mut world);
        assert_eq!(view.cameras.len(), 2);
        assert!(view.cameras[1].is_main);
        assert_eq!(view.main_camera().unwrap().entity, main);

        view.record_swap(main);
        view.apply_swaps(&mut world);
        let camera = world.get::<Camera>(main).unwrap();
        assert!(Arc::ptr_eq(camera.front_buffer.as_ref().unwrap(), &main_back));
        assert!(view.pending_swaps().is_empty());
    }
}
