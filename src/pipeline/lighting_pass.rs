//! Shadowed deferred lighting
//!
//! `pre_render` draws scene depth from every shadow light into the light's own target.
//! `post_render` sums light contributions into an HDR accumulation buffer, then combines
//! that buffer with the main camera's albedo under an exposure curve:
//!
//! ```text
//! shadow depth (per light) -> accumulation: ambient + shadow lights + point lights
//!                          -> final composite into the main buffer
//! ```

use crate::backend::*;
use crate::frame_state::{DepthRange, FrameSnapshot};
use crate::pipeline::{create_fullscreen_quad, FrameContext, FrameLayer};
use crate::render_target::{RenderBufferDesc, RenderTarget, SharedRenderTarget};
use crate::resources::{Mesh, Shader};
use crate::scene::{SceneView, ShadowLightView};
use crate::shaders;
use crate::LightingConfig;
use glam::{Mat3, Vec2, Vec3};
use std::sync::Arc;

/// Depth offset applied before the shadow comparison
const SHADOW_BIAS: f32 = 0.000001;

/// Texture slots read by the shadow composite
const SLOT_ALBEDO: u32 = 0;
const SLOT_DEPTH: u32 = 1;
const SLOT_SHADOW_DEPTH: u32 = 2;
const SLOT_NORMALS: u32 = 3;
const SLOT_PROJECTOR: u32 = 4;

pub struct LightingLayer {
    shadow_shader: Arc<Shader>,
    masked_shader: Arc<Shader>,
    shadow_composite: Arc<Shader>,
    point_composite: Arc<Shader>,
    final_composite: Arc<Shader>,
    quad: Arc<Mesh>,
    accumulation: SharedRenderTarget,
    ambient: Vec3,
    exposure: f32,
    exposure_dirty: bool,
}

impl LightingLayer {
    pub fn new(
        backend: &mut dyn GraphicsBackend,
        config: &LightingConfig,
        width: u32,
        height: u32,
    ) -> BackendResult<Self> {
        let shadow_shader = Shader::new(backend, "ShadowDepth", shaders::SHADOW_DEPTH)?;
        let masked_shader = Shader::new(backend, "ShadowMasked", shaders::SHADOW_MASKED)?;
        let shadow_composite =
            Shader::new(backend, "ShadowComposite", shaders::SHADOW_COMPOSITE)?;
        let point_composite =
            Shader::new(backend, "PointLightComposite", shaders::POINT_LIGHT_COMPOSITE)?;
        let final_composite = Shader::new(backend, "FinalComposite", shaders::FINAL_COMPOSITE)?;
        final_composite.set_uniform(backend, "a_Exposure", config.exposure);

        let mut accumulation = RenderTarget::new(backend, width, height, 1)?;
        accumulation.add_attachment(
            backend,
            RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb16Float, true),
        )?;
        accumulation.validate(backend);
        accumulation.set_debug_name(backend, "Accumulation");

        Ok(Self {
            shadow_shader,
            masked_shader,
            shadow_composite,
            point_composite,
            final_composite,
            quad: create_fullscreen_quad(backend)?,
            accumulation: accumulation.shared(),
            ambient: config.ambient,
            exposure: config.exposure,
            exposure_dirty: false,
        })
    }

    pub fn accumulation(&self) -> &SharedRenderTarget {
        &self.accumulation
    }

    pub fn ambient(&self) -> Vec3 {
        self.ambient
    }

    pub fn set_ambient(&mut self, ambient: Vec3) {
        self.ambient = ambient;
    }

    pub fn exposure(&self) -> f32 {
        self.exposure
    }

    /// Takes effect on the next composite
    pub fn set_exposure(&mut self, exposure: f32) {
        let exposure = exposure.max(f32::EPSILON);
        if exposure != self.exposure {
            self.exposure = exposure;
            self.exposure_dirty = true;
        }
    }

    pub fn shadow_composite_shader(&self) -> &Arc<Shader> {
        &self.shadow_composite
    }

    pub fn point_composite_shader(&self) -> &Arc<Shader> {
        &self.point_composite
    }

    pub fn final_composite_shader(&self) -> &Arc<Shader> {
        &self.final_composite
    }

    /// Render scene depth from one light's point of view
    fn shadow_pass(
        &self,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneView,
        light: &ShadowLightView,
    ) {
        let shader = match light.light.mask {
            Some(mask) => {
                backend.bind_image(0, Some(mask));
                &self.masked_shader
            }
            None => &self.shadow_shader,
        };
        shader.bind(backend);

        let mut buffer = light.light.shadow_buffer.write();
        let (width, height) = buffer.size();
        shader.set_uniform(
            backend,
            "a_OutputResolution",
            Vec2::new(width as f32, height as f32),
        );
        buffer.bind(backend, BindMode::Draw);
        backend.set_viewport(IRect::from_size(width, height));
        backend.clear(BufferFlags::DEPTH);

        let view_projection = light.light.projection * light.world.inverse();
        for (item, mesh, _) in scene.drawables().filter(|(item, _, _)| item.casts_shadows) {
            shader.set_uniform(
                backend,
                "a_ModelViewProjection",
                view_projection * item.world,
            );
            mesh.draw(backend);
        }

        buffer.unbind(backend);
        if light.light.mask.is_some() {
            backend.bind_image(0, None);
        }
    }

    fn composite_shadow_lights(
        &self,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneView,
        state: &FrameSnapshot,
        main: &RenderTarget,
        depth_range: DepthRange,
    ) {
        let shader = &self.shadow_composite;
        shader.bind(backend);
        let view_inv = state.view_inverse();
        shader.set_uniform(backend, "a_View", state.view);
        shader.set_uniform(backend, "a_ViewInv", view_inv);
        shader.set_uniform(backend, "a_CameraPos", view_inv.w_axis.truncate());
        shader.set_uniform(backend, "a_ProjectionInv", state.projection_inverse());
        shader.set_uniform(backend, "a_ViewProjectionInv", state.view_projection_inverse());
        match state.clip_planes(depth_range) {
            Ok(planes) => {
                shader.set_uniform(backend, "a_NearPlane", planes.near);
                shader.set_uniform(backend, "a_FarPlane", planes.far);
            }
            Err(err) => log::error!("Skipping clip plane upload for shadow composite: {}", err),
        }
        shader.set_uniform(backend, "a_Bias", SHADOW_BIAS);
        shader.set_uniform(backend, "a_MatShininess", 1.0f32);

        main.bind_attachment(backend, SLOT_ALBEDO, AttachmentSlot::Color0);
        main.bind_attachment(backend, SLOT_DEPTH, AttachmentSlot::Depth);
        main.bind_attachment(backend, SLOT_NORMALS, AttachmentSlot::Color1);

        for light in &scene.shadow_lights {
            match light.light.projector_image {
                Some(image) => {
                    shader.set_uniform(backend, "b_IsProjector", true);
                    shader.set_uniform(
                        backend,
                        "a_ProjectorIntensity",
                        light.light.projector_intensity,
                    );
                    backend.bind_image(SLOT_PROJECTOR, Some(image));
                }
                None => shader.set_uniform(backend, "b_IsProjector", false),
            }

            shader.set_uniform(
                backend,
                "a_LightView",
                light.light.projection * light.world.inverse(),
            );
            shader.set_uniform(backend, "a_LightPos", light.world.w_axis.truncate());
            shader.set_uniform(
                backend,
                "a_LightDir",
                Mat3::from_mat4(light.world) * Vec3::NEG_Z,
            );
            shader.set_uniform(backend, "a_LightColor", light.light.color);
            shader.set_uniform(backend, "a_LightAttenuation", light.light.attenuation);

            light
                .light
                .shadow_buffer
                .read()
                .bind_attachment(backend, SLOT_SHADOW_DEPTH, AttachmentSlot::Depth);
            self.quad.draw(backend);
        }
    }

    fn composite_point_lights(
        &self,
        backend: &mut dyn GraphicsBackend,
        scene: &SceneView,
        state: &FrameSnapshot,
        main: &RenderTarget,
    ) {
        let shader = &self.point_composite;
        shader.bind(backend);
        shader.set_uniform(backend, "a_View", state.view);
        shader.set_uniform(backend, "a_CameraPos", state.view_inverse().w_axis.truncate());
        shader.set_uniform(backend, "a_ViewProjectionInv", state.view_projection_inverse());
        shader.set_uniform(backend, "a_MatShininess", 1.0f32);

        main.bind_attachment(backend, 0, AttachmentSlot::Color0);
        main.bind_attachment(backend, 1, AttachmentSlot::Depth);
        main.bind_attachment(backend, 2, AttachmentSlot::Color1);

        for light in &scene.point_lights {
            shader.set_uniform(backend, "a_LightPos", light.position());
            shader.set_uniform(backend, "a_LightColor", light.light.color);
            shader.set_uniform(backend, "a_LightAttenuation", light.light.attenuation);
            self.quad.draw(backend);
        }
    }
}

fn unbind_slots(backend: &mut dyn GraphicsBackend, slots: std::ops::Range<u32>) {
    for slot in slots {
        backend.bind_image(slot, None);
    }
}

impl FrameLayer for LightingLayer {
    fn name(&self) -> &str {
        "Lighting"
    }

    fn on_window_resize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        _scene: &SceneView,
        width: u32,
        height: u32,
    ) {
        if let Err(err) = self.accumulation.write().resize(backend, width, height) {
            log::error!("Failed to resize accumulation buffer: {}", err);
        }
    }

    fn pre_render(&mut self, ctx: &mut FrameContext<'_>) {
        let scene = ctx.scene;
        if scene.shadow_lights.is_empty() {
            return;
        }

        ctx.backend.set_depth_test(true);
        ctx.backend.set_blend_state(None);
        // Front faces are culled to keep acne off thin geometry
        ctx.backend.set_cull_mode(CullMode::Front);
        for light in &scene.shadow_lights {
            self.shadow_pass(ctx.backend, scene, light);
        }
        ctx.backend.set_cull_mode(CullMode::Back);
    }

    fn post_render(&mut self, ctx: &mut FrameContext<'_>) {
        let scene = ctx.scene;
        let depth_range = ctx.depth_range;
        let state = ctx.frame_state.current().clone();
        let Some(main) = state.output.clone() else {
            log::debug!("No main camera output, skipping lighting");
            return;
        };
        let backend = &mut *ctx.backend;

        if self.exposure_dirty {
            self.final_composite
                .set_uniform(backend, "a_Exposure", self.exposure);
            self.exposure_dirty = false;
        }

        let mut accumulation = self.accumulation.write();
        accumulation.bind(backend, BindMode::Draw);
        let (width, height) = accumulation.size();
        backend.set_viewport(IRect::from_size(width, height));
        backend.set_clear_color(self.ambient.extend(1.0));
        backend.clear(BufferFlags::COLOR);
        backend.set_depth_test(false);
        backend.set_cull_mode(CullMode::None);
        backend.set_blend_state(Some(BlendState::additive()));

        {
            let main = main.read();
            self.composite_shadow_lights(backend, scene, &state, &main, depth_range);
            self.composite_point_lights(backend, scene, &state, &main);
        }

        accumulation.unbind(backend);
        backend.set_blend_state(None);
        unbind_slots(backend, 0..5);

        let mut main = main.write();
        main.bind(backend, BindMode::Draw);
        backend.set_viewport(IRect::from_size(main.width(), main.height()));
        self.final_composite.bind(backend);
        main.bind_attachment(backend, 1, AttachmentSlot::Color0);
        accumulation.bind_color(backend, 2);
        self.quad.draw(backend);
        main.unbind(backend);
        unbind_slots(backend, 1..3);
    }

    fn show_ui(&mut self, ctx: &egui::Context) {
        egui::Window::new("Lighting Settings").show(ctx, |ui| {
            let mut exposure = self.exposure;
            if ui
                .add(egui::Slider::new(&mut exposure, 0.1..=10.0).text("Exposure"))
                .changed()
            {
                self.set_exposure(exposure);
            }

            let mut ambient = self.ambient.to_array();
            ui.horizontal(|ui| {
                ui.color_edit_button_rgb(&mut ambient);
                ui.label("Ambient");
            });
            self.ambient = Vec3::from_array(ambient);
        });
    }

    fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        for shader in [
            &self.shadow_shader,
            &self.masked_shader,
            &self.shadow_composite,
            &self.point_composite,
            &self.final_composite,
        ] {
            shader.destroy(backend);
        }
        self.quad.destroy(backend);
        self.accumulation.write().destroy(backend);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_state::FrameStateStore;
    use crate::scene::{create_gbuffer_target, Camera, PointLight, Transform};
    use bevy_ecs::prelude::*;
    use glam::Mat4;

    struct Fixture {
        backend: HeadlessBackend,
        world: World,
        layer: LightingLayer,
        main: SharedRenderTarget,
    }

    fn fixture() -> Fixture {
        let mut backend = HeadlessBackend::new(32, 32);
        let layer = LightingLayer::new(&mut backend, &LightingConfig::default(), 32, 32).unwrap();
        let main = create_gbuffer_target(&mut backend, 32, 32, 1).unwrap().shared();
        let mut world = World::new();
        world.spawn((
            Camera::main(main.clone(), Mat4::perspective_rh(1.0, 1.0, 0.1, 50.0)),
            Transform::from_position(Vec3::new(0.0, 1.0, 6.0)),
        ));
        Fixture {
            backend,
            world,
            layer,
            main,
        }
    }

    fn post_render(fixture: &mut Fixture) {
        let scene = SceneView::extract(&mut fixture.world);
        let mut frame_state = FrameStateStore::new();
        let camera = scene.main_camera().unwrap();
        frame_state.advance(
            FrameSnapshot::new(Some(fixture.main.clone()), camera.view(), camera.projection),
            None,
        );
        let mut ctx = FrameContext {
            backend: &mut fixture.backend,
            scene: &scene,
            frame_state: &mut frame_state,
            surface_size: (32, 32),
            time: 0.0,
            depth_range: DepthRange::ZeroToOne,
        };
        fixture.layer.post_render(&mut ctx);
    }

    #[test]
    fn test_point_lights_accumulate_then_composite() {
        let mut fixture = fixture();
        fixture
            .world
            .spawn((PointLight::default(), Transform::from_position(Vec3::Y)));
        post_render(&mut fixture);

        let accumulation = fixture.layer.accumulation().read().framebuffer();
        let main = fixture.main.read().framebuffer();
        let draws: Vec<_> = fixture.backend.draws().collect();
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].framebuffer, Some(accumulation));
        assert_eq!(draws[0].blend, Some(BlendState::additive()));
        assert!(!draws[0].depth_test);
        assert_eq!(
            draws[0].shader,
            Some(fixture.layer.point_composite_shader().handle())
        );
        assert_eq!(draws[1].framebuffer, Some(main));
        assert_eq!(draws[1].blend, None);
        assert_eq!(
            draws[1].images.get(&2).copied(),
            fixture.layer.accumulation().read().get_attachment(AttachmentSlot::Color0)
        );

        let near = fixture
            .backend
            .uniform(fixture.layer.shadow_composite_shader().handle(), "a_NearPlane");
        match near {
            Some(UniformValue::Float(near)) => assert!((near - 0.1).abs() < 1e-3),
            other => panic!("unexpected near plane {:?}", other),
        }
    }

    #[test]
    fn test_accumulation_cleared_to_ambient() {
        let mut fixture = fixture();
        fixture.layer.set_ambient(Vec3::splat(0.25));
        post_render(&mut fixture);

        let image = fixture
            .layer
            .accumulation()
            .read()
            .get_attachment(AttachmentSlot::Color0)
            .unwrap();
        let texels = fixture.backend.read_image(image).unwrap();
        assert!(texels
            .iter()
            .all(|texel| texel.truncate().abs_diff_eq(Vec3::splat(0.25), 1e-6)));
    }

    #[test]
    fn test_exposure_uploaded_when_changed() {
        let mut fixture = fixture();
        let shader = fixture.layer.final_composite_shader().handle();
        assert_eq!(
            fixture.backend.uniform(shader, "a_Exposure"),
            Some(UniformValue::Float(1.0))
        );

        fixture.layer.set_exposure(2.5);
        assert_eq!(
            fixture.backend.uniform(shader, "a_Exposure"),
            Some(UniformValue::Float(1.0))
        );
        post_render(&mut fixture);
        assert_eq!(
            fixture.backend.uniform(shader, "a_Exposure"),
            Some(UniformValue::Float(2.5))
        );
    }
}
