//! wgpu egui overlay

use egui::ViewportId;
use egui_wgpu::ScreenDescriptor;
use winit::event::WindowEvent;
use winit::window::Window;

use crate::backend::wgpu_backend::WgpuBackend;
use crate::backend::GraphicsBackend;

/// Draws egui windows on top of the rendered frame
pub struct EguiOverlay {
    ctx: egui::Context,
    winit_state: egui_winit::State,
    renderer: egui_wgpu::Renderer,
    paint_jobs: Vec<egui::ClippedPrimitive>,
    textures_delta: egui::TexturesDelta,
    /// Surface size over window size; differs when the surface was clamped to device limits
    input_scale: f32,
}

impl EguiOverlay {
    pub fn new(backend: &WgpuBackend, window: &Window) -> Self {
        let ctx = egui::Context::default();
        let winit_state = egui_winit::State::new(
            ctx.clone(),
            ViewportId::ROOT,
            window,
            Some(window.scale_factor() as f32),
            None,
        );
        let renderer = egui_wgpu::Renderer::new(
            backend.device(),
            backend.wgpu_surface_format(),
            None,
            1,
        );

        let mut overlay = Self {
            ctx,
            winit_state,
            renderer,
            paint_jobs: Vec::new(),
            textures_delta: egui::TexturesDelta::default(),
            input_scale: 1.0,
        };
        let size = window.inner_size();
        overlay.on_resize(backend, size.width, size.height);
        overlay
    }

    /// Track the ratio between the window and its (possibly clamped) surface
    pub fn on_resize(&mut self, backend: &WgpuBackend, window_width: u32, window_height: u32) {
        if window_width == 0 || window_height == 0 {
            return;
        }
        let (surface_width, surface_height) = backend.surface_size();
        let scale_x = surface_width as f32 / window_width as f32;
        let scale_y = surface_height as f32 / window_height as f32;
        self.input_scale = scale_x.min(scale_y);
    }

    /// Feed a window event to egui; returns true when egui consumed it
    pub fn on_window_event(&mut self, window: &Window, event: &WindowEvent) -> bool {
        let scaled = match event {
            WindowEvent::CursorMoved {
                device_id,
                position,
            } if self.input_scale != 1.0 => Some(WindowEvent::CursorMoved {
                device_id: *device_id,
                position: winit::dpi::PhysicalPosition::new(
                    position.x * self.input_scale as f64,
                    position.y * self.input_scale as f64,
                ),
            }),
            _ => None,
        };
        self.winit_state
            .on_window_event(window, scaled.as_ref().unwrap_or(event))
            .consumed
    }

    /// Build this frame's UI
    pub fn run(&mut self, window: &Window, build: impl FnOnce(&egui::Context)) {
        let mut raw_input = self.winit_state.take_egui_input(window);
        if self.input_scale != 1.0 {
            if let Some(rect) = &mut raw_input.screen_rect {
                rect.max.x *= self.input_scale;
                rect.max.y *= self.input_scale;
            }
        }

        self.ctx.begin_frame(raw_input);
        build(&self.ctx);
        let output = self.ctx.end_frame();

        self.winit_state
            .handle_platform_output(window, output.platform_output);
        self.paint_jobs = self.ctx.tessellate(output.shapes, output.pixels_per_point);
        self.textures_delta.append(output.textures_delta);
    }

    /// Upload and draw the last built UI into the current frame
    pub fn render(&mut self, backend: &mut WgpuBackend) {
        let (width, height) = backend.surface_size();
        let screen_descriptor = ScreenDescriptor {
            size_in_pixels: [width, height],
            pixels_per_point: self.ctx.pixels_per_point(),
        };

        let (device, queue, encoder) = backend.device_queue_encoder();
        let Some(encoder) = encoder else {
            log::debug!("egui overlay skipped, no frame in flight");
            return;
        };
        for (id, delta) in &self.textures_delta.set {
            self.renderer.update_texture(device, queue, *id, delta);
        }
        self.renderer
            .update_buffers(device, queue, encoder, &self.paint_jobs, &screen_descriptor);

        backend.render_egui(&self.renderer, &self.paint_jobs, &screen_descriptor);

        for id in &self.textures_delta.free {
            self.renderer.free_texture(id);
        }
        self.textures_delta = egui::TexturesDelta::default();
    }

    pub fn context(&self) -> &egui::Context {
        &self.ctx
    }

    pub fn wants_keyboard_input(&self) -> bool {
        self.ctx.wants_keyboard_input()
    }
}
