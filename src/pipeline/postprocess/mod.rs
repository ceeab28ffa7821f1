//! Post-processing pass graph
//!
//! Passes are declared once at startup, each with its own program and output target.
//! Every frame the enabled passes in the execution sequence draw a full-screen quad:
//! texture slot 0 holds the previous enabled pass's output (the main camera buffer for
//! the first one) and slots `1..` hold the pass's declared inputs. The last output is
//! copied to the display.

mod builtins;

use crate::backend::*;
use crate::frame_state::FrameSnapshot;
use crate::pipeline::{create_fullscreen_quad, FrameContext, FrameLayer};
use crate::render_target::{RenderBufferDesc, RenderTarget, SharedRenderTarget};
use crate::resources::{Mesh, Shader};
use crate::scene::SceneView;
use crate::window::KeyInput;
use glam::{IVec2, Vec4};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use winit::keyboard::KeyCode;

/// Index of a pass in declaration order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PassId(pub usize);

/// Where a pass input comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSource {
    /// Output of another pass, as of its latest execution this frame
    Pass(PassId),
    /// The main camera's output this frame
    MainBuffer,
    /// The main camera's output last frame; this frame's when unavailable
    PreviousFrame,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassInput {
    pub source: InputSource,
    pub slot: AttachmentSlot,
}

impl PassInput {
    pub fn main(slot: AttachmentSlot) -> Self {
        Self {
            source: InputSource::MainBuffer,
            slot,
        }
    }

    pub fn pass(pass: PassId, slot: AttachmentSlot) -> Self {
        Self {
            source: InputSource::Pass(pass),
            slot,
        }
    }

    pub fn previous_frame(slot: AttachmentSlot) -> Self {
        Self {
            source: InputSource::PreviousFrame,
            slot,
        }
    }
}

/// A float uniform editable at runtime
#[derive(Debug, Clone, PartialEq)]
pub struct PassParameter {
    pub name: String,
    pub value: f32,
    pub min: f32,
    pub max: f32,
}

pub struct PostPass {
    name: String,
    shader: Arc<Shader>,
    output: SharedRenderTarget,
    inputs: Vec<PassInput>,
    parameters: Vec<PassParameter>,
    resolution_multiplier: f32,
    enabled: bool,
}

impl PostPass {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn shader(&self) -> &Arc<Shader> {
        &self.shader
    }

    pub fn output(&self) -> &SharedRenderTarget {
        &self.output
    }

    pub fn inputs(&self) -> &[PassInput] {
        &self.inputs
    }

    pub fn parameters(&self) -> &[PassParameter] {
        &self.parameters
    }

    pub fn resolution_multiplier(&self) -> f32 {
        self.resolution_multiplier
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

/// Runtime requests handled by the graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostEvent {
    /// Flip the enabled state of every pass in a named group
    ToggleGroup(String),
}

/// Ordered, toggleable chain of full-screen passes
pub struct PostProcessGraph {
    passes: Vec<PostPass>,
    sequence: Vec<PassId>,
    groups: HashMap<String, Vec<PassId>>,
    key_bindings: HashMap<KeyCode, String>,
    quad: Arc<Mesh>,
    width: u32,
    height: u32,
    /// Parameters edited from the UI, uploaded on the next frame
    pending: Vec<(PassId, usize)>,
}

fn scaled(size: u32, multiplier: f32) -> u32 {
    ((size as f32 * multiplier) as u32).max(1)
}

impl PostProcessGraph {
    /// Empty graph for a window of the given size
    pub fn new(backend: &mut dyn GraphicsBackend, width: u32, height: u32) -> BackendResult<Self> {
        Ok(Self {
            passes: Vec::new(),
            sequence: Vec::new(),
            groups: HashMap::new(),
            key_bindings: HashMap::new(),
            quad: create_fullscreen_quad(backend)?,
            width,
            height,
            pending: Vec::new(),
        })
    }

    /// Declare a pass with its own program and an Rgb8 output scaled from the window size
    ///
    /// The pass does not run until it is pushed onto the execution sequence.
    pub fn add_pass(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        name: &str,
        source: &str,
        resolution_multiplier: f32,
    ) -> BackendResult<PassId> {
        let shader = Shader::new(backend, name, source)?;
        let mut output = RenderTarget::new(
            backend,
            scaled(self.width, resolution_multiplier),
            scaled(self.height, resolution_multiplier),
            1,
        )?;
        output.add_attachment(
            backend,
            RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, true),
        )?;
        output.validate(backend);
        output.set_debug_name(backend, name);

        let id = PassId(self.passes.len());
        self.passes.push(PostPass {
            name: name.to_string(),
            shader,
            output: output.shared(),
            inputs: Vec::new(),
            parameters: Vec::new(),
            resolution_multiplier,
            enabled: true,
        });
        log::info!("Declared post pass {:?} '{}'", id, name);
        Ok(id)
    }

    /// Append an input, bound to texture slot `inputs.len()` after this call
    pub fn add_input(&mut self, pass: PassId, input: PassInput) {
        if let InputSource::Pass(source) = input.source {
            debug_assert!(source.0 < self.passes.len(), "input from undeclared pass");
        }
        if let Some(pass) = self.passes.get_mut(pass.0) {
            pass.inputs.push(input);
        }
    }

    /// Declare an editable parameter and upload its default
    pub fn add_parameter(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        pass: PassId,
        name: &str,
        default: f32,
        min: f32,
        max: f32,
    ) {
        let Some(pass) = self.passes.get_mut(pass.0) else {
            return;
        };
        let value = default.clamp(min, max);
        pass.shader.set_uniform(backend, name, value);
        pass.parameters.push(PassParameter {
            name: name.to_string(),
            value,
            min,
            max,
        });
    }

    /// Append a pass to the execution sequence; a pass may run several times
    pub fn push(&mut self, pass: PassId) {
        self.sequence.push(pass);
    }

    /// Name a set of passes toggled together, optionally bound to a key
    pub fn add_toggle_group(
        &mut self,
        name: &str,
        key: Option<KeyCode>,
        passes: impl IntoIterator<Item = PassId>,
    ) {
        let unique: BTreeSet<_> = passes.into_iter().collect();
        self.groups
            .insert(name.to_string(), unique.into_iter().collect());
        if let Some(key) = key {
            self.key_bindings.insert(key, name.to_string());
        }
    }

    pub fn pass(&self, pass: PassId) -> Option<&PostPass> {
        self.passes.get(pass.0)
    }

    pub fn passes(&self) -> impl Iterator<Item = (PassId, &PostPass)> {
        self.passes
            .iter()
            .enumerate()
            .map(|(index, pass)| (PassId(index), pass))
    }

    pub fn sequence(&self) -> &[PassId] {
        &self.sequence
    }

    pub fn group(&self, name: &str) -> Option<&[PassId]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn key_binding(&self, key: KeyCode) -> Option<&str> {
        self.key_bindings.get(&key).map(String::as_str)
    }

    pub fn set_enabled(&mut self, pass: PassId, enabled: bool) {
        if let Some(pass) = self.passes.get_mut(pass.0) {
            pass.enabled = enabled;
        }
    }

    pub fn handle_event(&mut self, event: PostEvent) {
        match event {
            PostEvent::ToggleGroup(name) => {
                let Some(ids) = self.groups.get(&name) else {
                    log::warn!("Unknown post-processing group '{}'", name);
                    return;
                };
                for id in ids {
                    if let Some(pass) = self.passes.get_mut(id.0) {
                        pass.enabled = !pass.enabled;
                        log::info!(
                            "Post pass '{}' {}",
                            pass.name,
                            if pass.enabled { "enabled" } else { "disabled" }
                        );
                    }
                }
            }
        }
    }

    /// Clamp a parameter into its range and upload it
    ///
    /// Returns the stored value, or `None` if the pass has no such parameter.
    pub fn set_parameter(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        pass: PassId,
        name: &str,
        value: f32,
    ) -> Option<f32> {
        let pass = self.passes.get_mut(pass.0)?;
        let parameter = pass.parameters.iter_mut().find(|p| p.name == name)?;
        parameter.value = value.clamp(parameter.min, parameter.max);
        pass.shader
            .set_uniform(backend, &parameter.name, parameter.value);
        Some(parameter.value)
    }

    /// Output of the last enabled pass in the sequence
    pub fn final_pass(&self) -> Option<PassId> {
        self.sequence
            .iter()
            .rev()
            .copied()
            .find(|id| self.passes.get(id.0).is_some_and(|pass| pass.enabled))
    }

    fn flush_pending(&mut self, backend: &mut dyn GraphicsBackend) {
        for (id, index) in std::mem::take(&mut self.pending) {
            let Some(pass) = self.passes.get(id.0) else {
                continue;
            };
            if let Some(parameter) = pass.parameters.get(index) {
                pass.shader
                    .set_uniform(backend, &parameter.name, parameter.value);
            }
        }
    }

    fn target_for(
        &self,
        source: InputSource,
        main: &SharedRenderTarget,
        previous: &FrameSnapshot,
    ) -> SharedRenderTarget {
        match source {
            InputSource::Pass(id) => self
                .passes
                .get(id.0)
                .map_or_else(|| main.clone(), |pass| pass.output.clone()),
            InputSource::MainBuffer => main.clone(),
            InputSource::PreviousFrame => previous.output.clone().unwrap_or_else(|| main.clone()),
        }
    }

    fn run_pass(
        &self,
        backend: &mut dyn GraphicsBackend,
        id: PassId,
        last: &SharedRenderTarget,
        main: &SharedRenderTarget,
        state: (&FrameSnapshot, &FrameSnapshot),
        planes: Option<(f32, f32)>,
    ) {
        let (current, previous) = state;
        let pass = &self.passes[id.0];
        let mut output = pass.output.write();
        output.bind(backend, BindMode::Draw);
        backend.clear(BufferFlags::COLOR);
        let (width, height) = output.size();
        backend.set_viewport(IRect::from_size(width, height));

        let shader = &pass.shader;
        shader.bind(backend);
        bind_input(backend, last, &pass.output, &output, 0, AttachmentSlot::Color0);
        shader.set_uniform(backend, "xImage", 0i32);

        shader.set_uniform(backend, "a_View", current.view);
        shader.set_uniform(backend, "a_Projection", current.projection);
        shader.set_uniform(backend, "a_ProjectionInv", current.projection_inverse());
        shader.set_uniform(backend, "a_ViewProjection", current.view_projection);
        shader.set_uniform(backend, "a_ViewProjectionInv", current.view_projection_inverse());
        shader.set_uniform(backend, "a_PrevView", previous.view);
        shader.set_uniform(backend, "a_PrevProjection", previous.projection);
        shader.set_uniform(backend, "a_PrevProjectionInv", previous.projection_inverse());
        shader.set_uniform(backend, "a_PrevViewProjection", previous.view_projection);
        shader.set_uniform(
            backend,
            "a_PrevViewProjectionInv",
            previous.view_projection_inverse(),
        );
        if let Some((near, far)) = planes {
            shader.set_uniform(backend, "a_NearPlane", near);
            shader.set_uniform(backend, "a_FarPlane", far);
        }

        for (index, input) in pass.inputs.iter().enumerate() {
            let source = self.target_for(input.source, main, previous);
            bind_input(backend, &source, &pass.output, &output, index as u32 + 1, input.slot);
        }
        shader.set_uniform(
            backend,
            "xScreenRes",
            IVec2::new(width as i32, height as i32),
        );
        self.quad.draw(backend);
        output.unbind(backend);
    }
}

/// Bind `slot` of `source` to a texture slot, reusing the guard when it is the target
/// being drawn; a missing image clears the texture slot
fn bind_input(
    backend: &mut dyn GraphicsBackend,
    source: &SharedRenderTarget,
    drawing: &SharedRenderTarget,
    drawing_guard: &RenderTarget,
    texture_slot: u32,
    slot: AttachmentSlot,
) {
    let bound = if Arc::ptr_eq(source, drawing) {
        drawing_guard.bind_attachment(backend, texture_slot, slot)
    } else {
        source.read().bind_attachment(backend, texture_slot, slot)
    };
    if bound.is_none() {
        backend.bind_image(texture_slot, None);
    }
}

impl FrameLayer for PostProcessGraph {
    fn name(&self) -> &str {
        "Post"
    }

    fn on_window_resize(
        &mut self,
        backend: &mut dyn GraphicsBackend,
        _scene: &SceneView,
        width: u32,
        height: u32,
    ) {
        self.width = width;
        self.height = height;
        for pass in &self.passes {
            let result = pass.output.write().resize(
                backend,
                scaled(width, pass.resolution_multiplier),
                scaled(height, pass.resolution_multiplier),
            );
            if let Err(err) = result {
                log::error!("Failed to resize post pass '{}': {}", pass.name, err);
            }
        }
    }

    fn post_render(&mut self, ctx: &mut FrameContext<'_>) {
        let current = ctx.frame_state.current().clone();
        let previous = ctx.frame_state.previous().clone();
        let Some(main) = current.output.clone() else {
            log::debug!("No main camera output, skipping post-processing");
            return;
        };
        let backend = &mut *ctx.backend;
        self.flush_pending(backend);

        let planes = match current.clip_planes(ctx.depth_range) {
            Ok(planes) => Some((planes.near, planes.far)),
            Err(err) => {
                log::error!("Skipping clip plane upload for post passes: {}", err);
                None
            }
        };

        // Material state from the scene stage must not cull the full-screen quads
        backend.set_depth_test(false);
        backend.set_cull_mode(CullMode::None);
        backend.set_blend_state(None);
        backend.set_clear_color(Vec4::new(0.0, 0.0, 0.0, 1.0));

        let mut last = main.clone();
        for &id in &self.sequence {
            let Some(pass) = self.passes.get(id.0) else {
                continue;
            };
            if !pass.enabled {
                continue;
            }
            self.run_pass(backend, id, &last, &main, (&current, &previous), planes);
            last = pass.output.clone();
        }

        let source = last.read();
        let framebuffer = source
            .resolve_target()
            .map_or(source.framebuffer(), RenderTarget::framebuffer);
        backend.bind_framebuffer(BindMode::Read, Some(framebuffer));
        backend.bind_framebuffer(BindMode::Draw, None);
        let (surface_width, surface_height) = ctx.surface_size;
        RenderTarget::blit(
            backend,
            IRect::from_size(source.width(), source.height()),
            IRect::from_size(surface_width, surface_height),
            BufferFlags::ALL,
            FilterMode::Nearest,
        );
        backend.bind_framebuffer(BindMode::Read, None);
    }

    fn update(&mut self, input: &KeyInput) {
        let toggled: Vec<String> = self
            .key_bindings
            .iter()
            .filter(|(key, _)| input.was_pressed(**key))
            .map(|(_, group)| group.clone())
            .collect();
        for group in toggled {
            self.handle_event(PostEvent::ToggleGroup(group));
        }
    }

    fn show_ui(&mut self, ctx: &egui::Context) {
        let mut changed = Vec::new();
        egui::Window::new("Post Processing").show(ctx, |ui| {
            for (index, pass) in self.passes.iter_mut().enumerate() {
                if pass.parameters.is_empty() {
                    continue;
                }
                egui::CollapsingHeader::new(pass.name.as_str())
                    .id_source(index)
                    .show(ui, |ui| {
                        for (param_index, parameter) in pass.parameters.iter_mut().enumerate() {
                            let slider = egui::Slider::new(
                                &mut parameter.value,
                                parameter.min..=parameter.max,
                            )
                            .text(parameter.name.as_str());
                            if ui.add(slider).changed() {
                                changed.push((PassId(index), param_index));
                            }
                        }
                    });
            }
        });
        self.pending.extend(changed);
    }

    fn destroy(&mut self, backend: &mut dyn GraphicsBackend) {
        for pass in &self.passes {
            pass.shader.destroy(backend);
            pass.output.write().destroy(backend);
        }
        self.quad.destroy(backend);
    }
}
