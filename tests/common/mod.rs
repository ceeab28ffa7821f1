//! Shared fixtures for the integration tests

#![allow(dead_code)]

use deferred_frame_pipeline::backend::{AttachmentSlot, GraphicsBackend, HeadlessBackend};
use deferred_frame_pipeline::resources::{Material, Mesh, MeshData, Shader};
use deferred_frame_pipeline::scene::{create_gbuffer_target, Camera, Renderable, Transform};
use deferred_frame_pipeline::{
    shaders, BackendType, EngineConfig, Entity, PostConfig, Renderer, SharedRenderTarget, World,
};
use glam::{Mat4, Vec3, Vec4};
use std::sync::Arc;

pub const CLEAR_COLOR: Vec4 = Vec4::new(0.2, 0.4, 0.6, 1.0);

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn headless_config(post: PostConfig) -> EngineConfig {
    EngineConfig {
        backend: BackendType::Headless,
        post,
        ..EngineConfig::default()
    }
}

pub fn no_post() -> PostConfig {
    PostConfig {
        bloom: false,
        motion_blur: false,
        depth_of_field: false,
        ..PostConfig::default()
    }
}

pub fn renderer(width: u32, height: u32, post: PostConfig) -> Renderer {
    init_logging();
    Renderer::new(
        Box::new(HeadlessBackend::new(width, height)),
        headless_config(post),
    )
    .unwrap()
}

pub fn headless(renderer: &Renderer) -> &HeadlessBackend {
    renderer.backend_as::<HeadlessBackend>().unwrap()
}

pub fn headless_mut(renderer: &mut Renderer) -> &mut HeadlessBackend {
    renderer.backend_as_mut::<HeadlessBackend>().unwrap()
}

pub fn projection() -> Mat4 {
    Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0)
}

/// Spawn a single-buffered main camera sized to the surface
pub fn spawn_main_camera(
    renderer: &mut Renderer,
    world: &mut World,
    position: Vec3,
) -> (Entity, SharedRenderTarget) {
    let (width, height) = renderer.backend().surface_size();
    let target = create_gbuffer_target(renderer.backend_mut(), width, height, 1)
        .unwrap()
        .shared();
    let entity = world
        .spawn((
            Camera::main(target.clone(), projection()).with_clear_color(CLEAR_COLOR),
            Transform::looking_at(position, Vec3::ZERO, Vec3::Y),
        ))
        .id();
    (entity, target)
}

/// Spawn one shadow-casting cube at the origin
pub fn spawn_cube(renderer: &mut Renderer, world: &mut World) -> Entity {
    let backend = renderer.backend_mut();
    let shader = Shader::new(backend, "SceneGBuffer", shaders::SCENE_GBUFFER).unwrap();
    let material = Arc::new(Material::new("Cube", shader).with_uniform("a_Albedo", Vec3::ONE));
    let mesh = Mesh::upload(backend, &MeshData::cube()).unwrap();
    world
        .spawn((Renderable::new(mesh, material), Transform::new()))
        .id()
}

/// Texels of a target's color attachment, read through its resolve target when multisampled
pub fn color_texels(renderer: &Renderer, target: &SharedRenderTarget) -> Vec<Vec4> {
    let image = target
        .read()
        .get_attachment(AttachmentSlot::Color0)
        .unwrap();
    headless(renderer).read_image(image).unwrap().to_vec()
}
