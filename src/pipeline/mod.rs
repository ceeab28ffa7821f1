//! Frame pipeline
//!
//! A frame is a fixed sequence over the layers, in order scene, lighting, post:
//! 1. `pre_render` - shadow depth passes
//! 2. `render` - cameras draw the scene into their G-buffers
//! 3. `post_render` - light accumulation and composite, then the post-processing chain
//!
//! Layers receive everything they touch through [`FrameContext`]; none of them reads the
//! ECS world or keeps GPU binding state between calls.

mod lighting_pass;
mod postprocess;
mod scene_pass;

pub use lighting_pass::LightingLayer;
pub use postprocess::*;
pub use scene_pass::SceneLayer;

use crate::backend::{BackendResult, GraphicsBackend};
use crate::frame_state::{DepthRange, FrameStateStore};
use crate::resources::{Mesh, MeshData};
use crate::scene::SceneView;
use crate::window::KeyInput;
use std::sync::Arc;

/// Explicit per-frame state handed to every layer hook
pub struct FrameContext<'a> {
    pub backend: &'a mut dyn GraphicsBackend,
    pub scene: &'a SceneView,
    pub frame_state: &'a mut FrameStateStore,
    pub surface_size: (u32, u32),
    /// Seconds since the renderer was created
    pub time: f32,
    pub depth_range: DepthRange,
}

/// One stage of the frame
///
/// Every hook defaults to doing nothing.
pub trait FrameLayer {
    fn name(&self) -> &str;

    /// Immediate callback when the display surface changes size
    fn on_window_resize(
        &mut self,
        _backend: &mut dyn GraphicsBackend,
        _scene: &SceneView,
        _width: u32,
        _height: u32,
    ) {
    }

    fn pre_render(&mut self, _ctx: &mut FrameContext<'_>) {}

    fn render(&mut self, _ctx: &mut FrameContext<'_>) {}

    fn post_render(&mut self, _ctx: &mut FrameContext<'_>) {}

    /// Key presses since the previous update
    fn update(&mut self, _input: &KeyInput) {}

    fn show_ui(&mut self, _ctx: &egui::Context) {}

    /// Release GPU resources owned by the layer
    fn destroy(&mut self, _backend: &mut dyn GraphicsBackend) {}
}

/// Upload the quad every full-screen pass draws
pub(crate) fn create_fullscreen_quad(
    backend: &mut dyn GraphicsBackend,
) -> BackendResult<Arc<Mesh>> {
    Mesh::upload(backend, &MeshData::fullscreen_quad())
}
