//! Scene layer
//!
//! Every camera clears its back buffer and draws the sorted renderables into it. Shader
//! changes upload the per-camera uniforms, material changes apply raster state, and every
//! draw uploads its own transforms. The main camera is drawn last and advances the frame
//! state.

use crate::backend::{BindMode, BufferFlags, CullMode, GraphicsBackend, IRect};
use crate::frame_state::FrameSnapshot;
use crate::pipeline::{FrameContext, FrameLayer};
use crate::resources::{Material, Shader};
use crate::scene::{CameraView, SceneView};
use glam::Mat3;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct SceneLayer {
    frames: u64,
}

impl SceneLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames drawn so far
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn draw_camera(ctx: &mut FrameContext<'_>, camera: &CameraView) {
        let scene = ctx.scene;
        let view = camera.view();
        let view_projection = camera.projection * view;
        let position = camera.position();

        let mut target = camera.back_buffer.write();
        target.bind(ctx.backend, BindMode::Draw);
        ctx.backend
            .set_viewport(IRect::from_size(target.width(), target.height()));
        ctx.backend.set_clear_color(camera.clear_color);
        ctx.backend.clear(BufferFlags::ALL);
        ctx.backend.set_depth_test(true);
        ctx.backend.set_cull_mode(CullMode::Back);

        // Binding state is per camera so every camera gets its own a_CameraPos
        let mut bound_shader: Option<&Arc<Shader>> = None;
        let mut applied: Option<&Arc<Material>> = None;
        let mut draws = 0usize;

        for (item, mesh, material) in scene.drawables() {
            let shader = material.shader();
            if !bound_shader.is_some_and(|bound| Arc::ptr_eq(bound, shader)) {
                shader.bind(ctx.backend);
                shader.set_uniform(ctx.backend, "a_CameraPos", position);
                shader.set_uniform(ctx.backend, "a_Time", ctx.time);
                bound_shader = Some(shader);
            }
            if !applied.is_some_and(|current| Arc::ptr_eq(current, material)) {
                material.apply(ctx.backend);
                applied = Some(material);
            }

            let normal_matrix = Mat3::from_mat4(item.world.inverse().transpose());
            shader.set_uniform(
                ctx.backend,
                "a_ModelViewProjection",
                view_projection * item.world,
            );
            shader.set_uniform(ctx.backend, "a_Model", item.world);
            shader.set_uniform(ctx.backend, "a_NormalMatrix", normal_matrix);
            mesh.draw(ctx.backend);
            draws += 1;
        }

        target.unbind(ctx.backend);
        drop(target);
        log::debug!("Camera {:?} drew {} renderables", camera.entity, draws);

        if camera.front_buffer.is_some() {
            scene.record_swap(camera.entity);
        }

        if camera.is_main {
            // The buffer just drawn is this frame's output; a double-buffered camera's
            // other buffer still holds the previous frame
            ctx.frame_state.advance(
                FrameSnapshot::new(
                    Some(camera.back_buffer.clone()),
                    view,
                    camera.projection,
                ),
                camera.front_buffer.clone(),
            );
        }
    }
}

impl FrameLayer for SceneLayer {
    fn name(&self) -> &str {
        "Scene"
    }

    fn on_window_resize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneView,
        width: u32,
        height: u32,
    ) {
        for camera in scene.cameras.iter().filter(|camera| camera.is_main) {
            let buffers = std::iter::once(&camera.back_buffer).chain(camera.front_buffer.iter());
            for buffer in buffers {
                if let Err(err) = buffer.write().resize(backend, width, height) {
                    log::error!("Failed to resize main camera buffer: {}", err);
                }
            }
        }
    }

    fn render(&mut self, ctx: &mut FrameContext<'_>) {
        let scene = ctx.scene;
        for camera in &scene.cameras {
            Self::draw_camera(ctx, camera);
        }
        self.frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Command, HeadlessBackend, UniformValue};
    use crate::frame_state::{DepthRange, FrameStateStore};
    use crate::resources::{Mesh, MeshData};
    use crate::scene::{create_gbuffer_target, Camera, Renderable, Transform};
    use bevy_ecs::prelude::*;
    use glam::{Mat4, Vec3};

    fn run_frame(
        layer: &mut SceneLayer,
        backend: &mut HeadlessBackend,
        world: &mut World,
        frame_state: &mut FrameStateStore,
    ) {
        let scene = SceneView::extract(world);
        let mut ctx = FrameContext {
            backend,
            scene: &scene,
            frame_state,
            surface_size: (32, 32),
            time: 0.5,
            depth_range: DepthRange::ZeroToOne,
        };
        layer.render(&mut ctx);
        scene.apply_swaps(world);
    }

    #[test]
    fn test_draws_and_uploads_transforms() {
        let mut backend = HeadlessBackend::new(32, 32);
        let mut world = World::new();
        let shader = Shader::new(&mut backend, "lit", crate::shaders::SCENE_GBUFFER).unwrap();
        let material =
            Arc::new(Material::new("red", shader.clone()).with_uniform("a_Albedo", Vec3::X));
        let mesh = Mesh::upload(&mut backend, &MeshData::cube()).unwrap();
        let model = Transform::from_position(Vec3::new(1.0, 2.0, 3.0));
        world.spawn((Renderable::new(mesh, material), model));
        world.spawn(Renderable::default());

        let target = create_gbuffer_target(&mut backend, 32, 32, 1).unwrap().shared();
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        world.spawn((
            Camera::main(target.clone(), projection),
            Transform::from_position(Vec3::new(0.0, 0.0, 5.0)),
        ));

        let mut layer = SceneLayer::new();
        let mut frame_state = FrameStateStore::new();
        run_frame(&mut layer, &mut backend, &mut world, &mut frame_state);

        assert_eq!(backend.draws().count(), 1);
        let draw = backend.draws().next().unwrap();
        assert_eq!(draw.framebuffer, Some(target.read().framebuffer()));
        assert!(draw.depth_test);
        assert_eq!(draw.cull_mode, CullMode::Back);

        let view = Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0));
        let expected = projection * view * model.matrix();
        match backend.uniform(shader.handle(), "a_ModelViewProjection") {
            Some(UniformValue::Mat4(mvp)) => assert!(mvp.abs_diff_eq(expected, 1e-4)),
            other => panic!("unexpected uniform {:?}", other),
        }
        assert_eq!(
            backend.uniform(shader.handle(), "a_CameraPos"),
            Some(UniformValue::Vec3(Vec3::new(0.0, 0.0, 5.0)))
        );
        assert_eq!(
            backend.uniform(shader.handle(), "a_Albedo"),
            Some(UniformValue::Vec3(Vec3::X))
        );

        assert_eq!(frame_state.frames(), 1);
        assert!(frame_state.current().view.abs_diff_eq(view, 1e-5));
        assert!(Arc::ptr_eq(frame_state.current().output.as_ref().unwrap(), &target));
        assert!(frame_state.previous().output.is_none());
    }

    #[test]
    fn test_main_camera_cleared_with_its_color() {
        let mut backend = HeadlessBackend::new(16, 16);
        let mut world = World::new();
        let target = create_gbuffer_target(&mut backend, 16, 16, 1).unwrap().shared();
        let clear = glam::Vec4::new(0.2, 0.3, 0.4, 1.0);
        world.spawn(Camera::main(target.clone(), Mat4::IDENTITY).with_clear_color(clear));

        let mut layer = SceneLayer::new();
        let mut frame_state = FrameStateStore::new();
        run_frame(&mut layer, &mut backend, &mut world, &mut frame_state);

        let fb = target.read().framebuffer();
        assert!(backend.commands().iter().any(|command| matches!(
            command,
            Command::Clear { framebuffer: Some(f), buffers, color }
                if *f == fb && *buffers == BufferFlags::ALL && *color == clear
        )));
    }

    #[test]
    fn test_double_buffered_previous_output_is_prior_image() {
        let mut backend = HeadlessBackend::new(16, 16);
        let mut world = World::new();
        let back = create_gbuffer_target(&mut backend, 16, 16, 1).unwrap().shared();
        let camera = Camera::main(back.clone(), Mat4::IDENTITY)
            .double_buffered(&mut backend)
            .unwrap();
        let front = camera.front_buffer.clone().unwrap();
        world.spawn(camera);

        let mut layer = SceneLayer::new();
        let mut frame_state = FrameStateStore::new();
        run_frame(&mut layer, &mut backend, &mut world, &mut frame_state);
        assert!(Arc::ptr_eq(frame_state.current().output.as_ref().unwrap(), &back));
        assert!(Arc::ptr_eq(frame_state.previous().output.as_ref().unwrap(), &front));

        run_frame(&mut layer, &mut backend, &mut world, &mut frame_state);
        assert!(Arc::ptr_eq(frame_state.current().output.as_ref().unwrap(), &front));
        assert!(Arc::ptr_eq(frame_state.previous().output.as_ref().unwrap(), &back));
        assert_eq!(layer.frames(), 2);
    }
}
