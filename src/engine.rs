//! Main renderer orchestrator

use crate::backend::*;
use crate::frame_state::FrameStateStore;
use crate::pipeline::{FrameContext, FrameLayer, LightingLayer, PostProcessGraph, SceneLayer};
use crate::scene::SceneView;
use crate::window::KeyInput;
use crate::EngineConfig;
use bevy_ecs::world::World;
use std::time::Instant;

/// Drives the scene, lighting and post layers over a backend, once per frame
pub struct Renderer {
    backend: Box<dyn GraphicsBackend>,
    scene_layer: SceneLayer,
    lighting_layer: LightingLayer,
    post_layer: PostProcessGraph,
    frame_state: FrameStateStore,
    config: EngineConfig,
    start: Instant,
    destroyed: bool,
}

impl Renderer {
    /// Create the layers for the backend's current surface size
    pub fn new(mut backend: Box<dyn GraphicsBackend>, config: EngineConfig) -> BackendResult<Self> {
        let (width, height) = backend.surface_size();
        log::info!(
            "Creating renderer on {} backend ({}x{})",
            backend.name(),
            width,
            height
        );
        let lighting_layer =
            LightingLayer::new(backend.as_mut(), &config.lighting, width, height)?;
        let post_layer =
            PostProcessGraph::with_builtins(backend.as_mut(), &config.post, width, height)?;

        Ok(Self {
            backend,
            scene_layer: SceneLayer::new(),
            lighting_layer,
            post_layer,
            frame_state: FrameStateStore::new(),
            config,
            start: Instant::now(),
            destroyed: false,
        })
    }

    /// Render and present a frame
    pub fn render_frame(&mut self, world: &mut World) {
        if self.render_scene(world) {
            self.end_frame();
        }
    }

    /// Render without presenting; call [`Renderer::end_frame`] after drawing overlays
    ///
    /// Returns false when the backend could not begin a frame.
    pub fn render_scene(&mut self, world: &mut World) -> bool {
        if let Err(err) = self.backend.begin_frame() {
            if matches!(err, BackendError::SurfaceLost) {
                let (width, height) = self.backend.surface_size();
                log::warn!("Surface lost, reconfiguring at {}x{}", width, height);
                self.backend.resize_surface(width, height);
            } else {
                log::error!("Failed to begin frame: {}", err);
            }
            return false;
        }

        let scene = SceneView::extract(world);
        let surface_size = self.backend.surface_size();
        let mut ctx = FrameContext {
            backend: self.backend.as_mut(),
            scene: &scene,
            frame_state: &mut self.frame_state,
            surface_size,
            time: self.start.elapsed().as_secs_f32(),
            depth_range: self.config.depth_range,
        };

        let mut layers: [&mut dyn FrameLayer; 3] = [
            &mut self.scene_layer,
            &mut self.lighting_layer,
            &mut self.post_layer,
        ];
        for layer in layers.iter_mut() {
            layer.pre_render(&mut ctx);
        }
        for layer in layers.iter_mut() {
            layer.render(&mut ctx);
        }
        for layer in layers.iter_mut() {
            layer.post_render(&mut ctx);
        }

        scene.apply_swaps(world);
        true
    }

    /// Present the frame
    pub fn end_frame(&mut self) {
        if let Err(err) = self.backend.end_frame() {
            log::error!("Failed to end frame: {}", err);
        }
    }

    /// Handle window resize
    pub fn resize(&mut self, world: &mut World, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.backend.resize_surface(width, height);
        let (width, height) = self.backend.surface_size();
        log::info!("Resizing renderer to {}x{}", width, height);

        let scene = SceneView::extract(world);
        let backend = self.backend.as_mut();
        let layers: [&mut dyn FrameLayer; 3] = [
            &mut self.scene_layer,
            &mut self.lighting_layer,
            &mut self.post_layer,
        ];
        for layer in layers {
            layer.on_window_resize(backend, &scene, width, height);
        }
    }

    /// Forward key presses to every layer
    pub fn update(&mut self, input: &KeyInput) {
        self.scene_layer.update(input);
        self.lighting_layer.update(input);
        self.post_layer.update(input);
    }

    /// Build each layer's settings window
    pub fn show_ui(&mut self, ctx: &egui::Context) {
        self.scene_layer.show_ui(ctx);
        self.lighting_layer.show_ui(ctx);
        self.post_layer.show_ui(ctx);
    }

    pub fn backend(&self) -> &dyn GraphicsBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut dyn GraphicsBackend {
        self.backend.as_mut()
    }

    /// Downcast the backend to its concrete type
    pub fn backend_as<T: 'static>(&self) -> Option<&T> {
        self.backend.as_any().downcast_ref::<T>()
    }

    pub fn backend_as_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.backend.as_any_mut().downcast_mut::<T>()
    }

    pub fn scene_layer(&self) -> &SceneLayer {
        &self.scene_layer
    }

    pub fn lighting_layer(&self) -> &LightingLayer {
        &self.lighting_layer
    }

    pub fn lighting_layer_mut(&mut self) -> &mut LightingLayer {
        &mut self.lighting_layer
    }

    pub fn post_layer(&self) -> &PostProcessGraph {
        &self.post_layer
    }

    pub fn post_layer_mut(&mut self) -> &mut PostProcessGraph {
        &mut self.post_layer
    }

    pub fn frame_state(&self) -> &FrameStateStore {
        &self.frame_state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Release every layer's GPU resources; also runs on drop
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        let backend = self.backend.as_mut();
        self.post_layer.destroy(backend);
        self.lighting_layer.destroy(backend);
        self.scene_layer.destroy(backend);
        self.destroyed = true;
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::{create_gbuffer_target, Camera};
    use glam::Mat4;

    fn renderer(width: u32, height: u32) -> Renderer {
        Renderer::new(
            Box::new(HeadlessBackend::new(width, height)),
            EngineConfig {
                backend: crate::BackendType::Headless,
                ..EngineConfig::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_frame_without_camera_skips_post() {
        let mut renderer = renderer(32, 32);
        let mut world = World::new();
        renderer.render_frame(&mut world);

        let backend = renderer.backend_as::<HeadlessBackend>().unwrap();
        assert_eq!(backend.draws().count(), 0);
        assert_eq!(backend.frames_presented(), 1);
    }

    #[test]
    fn test_resize_reaches_every_layer() {
        let mut renderer = renderer(32, 32);
        let mut world = World::new();
        let target = create_gbuffer_target(renderer.backend_mut(), 32, 32, 1)
            .unwrap()
            .shared();
        world.spawn(Camera::main(target.clone(), Mat4::IDENTITY));

        renderer.resize(&mut world, 100, 50);
        assert_eq!(renderer.backend().surface_size(), (100, 50));
        assert_eq!(target.read().size(), (100, 50));
        assert_eq!(
            renderer.lighting_layer().accumulation().read().size(),
            (100, 50)
        );
        let (_, pass) = renderer.post_layer().passes().next().unwrap();
        assert_eq!(pass.output().read().size(), (100, 50));
    }

    #[test]
    fn test_zero_size_resize_ignored() {
        let mut renderer = renderer(32, 32);
        renderer.resize(&mut World::new(), 0, 10);
        assert_eq!(renderer.backend().surface_size(), (32, 32));
    }
}
