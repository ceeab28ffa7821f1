//! Headless backend
//!
//! Runs the whole device model on the CPU. Images keep one `Vec4` texel per pixel, clears
//! and blits are simulated, draws are recorded but not rasterized. Every call is appended
//! to a command log so stage behaviour can be inspected without a GPU.

use crate::backend::completeness::{self, AttachmentInfo, CompletenessError};
use crate::backend::traits::*;
use crate::backend::types::*;
use glam::Vec4;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};

/// Depth value written by a depth clear
pub const CLEAR_DEPTH: f32 = 1.0;

/// A draw call with the device state it was issued under
#[derive(Debug, Clone, PartialEq)]
pub struct DrawRecord {
    pub framebuffer: Option<FramebufferHandle>,
    pub shader: Option<ShaderHandle>,
    pub mesh: MeshHandle,
    pub viewport: IRect,
    pub depth_test: bool,
    pub cull_mode: CullMode,
    pub blend: Option<BlendState>,
    pub images: BTreeMap<u32, ImageHandle>,
}

/// One recorded device command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindFramebuffer {
        mode: BindMode,
        framebuffer: Option<FramebufferHandle>,
    },
    Blit {
        read: Option<FramebufferHandle>,
        draw: Option<FramebufferHandle>,
        desc: BlitDescriptor,
    },
    Clear {
        framebuffer: Option<FramebufferHandle>,
        buffers: BufferFlags,
        color: Vec4,
    },
    SetViewport(IRect),
    SetDepthTest(bool),
    SetCullMode(CullMode),
    SetBlendState(Option<BlendState>),
    UseShader(Option<ShaderHandle>),
    SetUniform {
        shader: ShaderHandle,
        name: String,
        value: UniformValue,
    },
    BindImage {
        slot: u32,
        image: Option<ImageHandle>,
    },
    Draw(DrawRecord),
}

/// Creation and destruction totals per resource kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceCounters {
    pub framebuffers_created: usize,
    pub framebuffers_destroyed: usize,
    pub images_created: usize,
    pub images_destroyed: usize,
    pub renderbuffers_created: usize,
    pub renderbuffers_destroyed: usize,
}

impl ResourceCounters {
    pub fn live_images(&self) -> usize {
        self.images_created - self.images_destroyed
    }

    pub fn live_renderbuffers(&self) -> usize {
        self.renderbuffers_created - self.renderbuffers_destroyed
    }

    pub fn live_framebuffers(&self) -> usize {
        self.framebuffers_created - self.framebuffers_destroyed
    }

    /// Images plus renderbuffers created so far
    pub fn backing_stores_created(&self) -> usize {
        self.images_created + self.renderbuffers_created
    }

    pub fn backing_stores_destroyed(&self) -> usize {
        self.images_destroyed + self.renderbuffers_destroyed
    }
}

struct StoredImage {
    desc: ImageDescriptor,
    texels: Vec<Vec4>,
    label: Option<String>,
}

impl StoredImage {
    fn new(desc: &ImageDescriptor) -> Self {
        let count = (desc.width as usize) * (desc.height as usize);
        Self {
            desc: desc.clone(),
            texels: vec![Vec4::ZERO; count],
            label: desc.label.clone(),
        }
    }

    fn info(&self) -> AttachmentInfo {
        AttachmentInfo {
            format: self.desc.format,
            width: self.desc.width,
            height: self.desc.height,
            samples: self.desc.samples,
        }
    }
}

#[derive(Default)]
struct StoredFramebuffer {
    label: Option<String>,
    attachments: BTreeMap<AttachmentSlot, AttachmentHandle>,
    draw_slots: Vec<AttachmentSlot>,
}

struct StoredShader {
    label: String,
    uniforms: HashMap<String, UniformValue>,
}

struct StoredMesh {
    label: String,
    index_count: usize,
}

/// CPU-only implementation of [`GraphicsBackend`]
pub struct HeadlessBackend {
    surface_width: u32,
    surface_height: u32,
    display: Vec<Vec4>,
    max_samples: u32,

    images: HashMap<u64, StoredImage>,
    renderbuffers: HashMap<u64, StoredImage>,
    framebuffers: HashMap<u64, StoredFramebuffer>,
    shaders: HashMap<u64, StoredShader>,
    meshes: HashMap<u64, StoredMesh>,
    next_id: u64,

    read_target: Option<FramebufferHandle>,
    draw_target: Option<FramebufferHandle>,
    viewport: IRect,
    clear_color: Vec4,
    depth_test: bool,
    cull_mode: CullMode,
    blend: Option<BlendState>,
    current_shader: Option<ShaderHandle>,
    bound_images: BTreeMap<u32, ImageHandle>,

    commands: Vec<Command>,
    counters: ResourceCounters,
    frames_presented: u64,
}

impl HeadlessBackend {
    /// Create a headless device with a display surface of the given size
    pub fn new(width: u32, height: u32) -> Self {
        log::info!("Headless backend created ({}x{})", width, height);
        Self {
            surface_width: width,
            surface_height: height,
            display: vec![Vec4::ZERO; (width as usize) * (height as usize)],
            max_samples: 8,
            images: HashMap::new(),
            renderbuffers: HashMap::new(),
            framebuffers: HashMap::new(),
            shaders: HashMap::new(),
            meshes: HashMap::new(),
            next_id: 1,
            read_target: None,
            draw_target: None,
            viewport: IRect::from_size(width, height),
            clear_color: Vec4::ZERO,
            depth_test: false,
            cull_mode: CullMode::None,
            blend: None,
            current_shader: None,
            bound_images: BTreeMap::new(),
            commands: Vec::new(),
            counters: ResourceCounters::default(),
            frames_presented: 0,
        }
    }

    pub fn with_max_samples(mut self, max_samples: u32) -> Self {
        self.max_samples = max_samples.max(1);
        self
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Recorded commands since creation or the last [`Self::clear_commands`]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn clear_commands(&mut self) {
        self.commands.clear();
    }

    pub fn counters(&self) -> ResourceCounters {
        self.counters
    }

    pub fn frames_presented(&self) -> u64 {
        self.frames_presented
    }

    /// Recorded draws, in order
    pub fn draws(&self) -> impl Iterator<Item = &DrawRecord> {
        self.commands.iter().filter_map(|cmd| match cmd {
            Command::Draw(record) => Some(record),
            _ => None,
        })
    }

    /// Recorded blits, in order
    pub fn blits(&self) -> impl Iterator<Item = (&Option<FramebufferHandle>, &Option<FramebufferHandle>, &BlitDescriptor)> {
        self.commands.iter().filter_map(|cmd| match cmd {
            Command::Blit { read, draw, desc } => Some((read, draw, desc)),
            _ => None,
        })
    }

    /// Last value stored for a uniform on a program
    pub fn uniform(&self, shader: ShaderHandle, name: &str) -> Option<UniformValue> {
        self.shaders
            .get(&shader.0)
            .and_then(|stored| stored.uniforms.get(name).copied())
    }

    pub fn shader_label(&self, shader: ShaderHandle) -> Option<&str> {
        self.shaders.get(&shader.0).map(|stored| stored.label.as_str())
    }

    pub fn mesh_index_count(&self, mesh: MeshHandle) -> Option<usize> {
        self.meshes.get(&mesh.0).map(|stored| stored.index_count)
    }

    pub fn mesh_label(&self, mesh: MeshHandle) -> Option<&str> {
        self.meshes.get(&mesh.0).map(|stored| stored.label.as_str())
    }

    pub fn image_exists(&self, image: ImageHandle) -> bool {
        self.images.contains_key(&image.0)
    }

    pub fn image_descriptor(&self, image: ImageHandle) -> Option<&ImageDescriptor> {
        self.images.get(&image.0).map(|stored| &stored.desc)
    }

    pub fn image_label(&self, image: ImageHandle) -> Option<&str> {
        self.images.get(&image.0).and_then(|stored| stored.label.as_deref())
    }

    pub fn renderbuffer_label(&self, renderbuffer: RenderbufferHandle) -> Option<&str> {
        self.renderbuffers
            .get(&renderbuffer.0)
            .and_then(|stored| stored.label.as_deref())
    }

    pub fn framebuffer_label(&self, framebuffer: FramebufferHandle) -> Option<&str> {
        self.framebuffers
            .get(&framebuffer.0)
            .and_then(|stored| stored.label.as_deref())
    }

    pub fn framebuffer_exists(&self, framebuffer: FramebufferHandle) -> bool {
        self.framebuffers.contains_key(&framebuffer.0)
    }

    /// Draw slot configuration last issued for a framebuffer
    pub fn draw_slots(&self, framebuffer: FramebufferHandle) -> Option<&[AttachmentSlot]> {
        self.framebuffers
            .get(&framebuffer.0)
            .map(|stored| stored.draw_slots.as_slice())
    }

    pub fn attachment(
        &self,
        framebuffer: FramebufferHandle,
        slot: AttachmentSlot,
    ) -> Option<AttachmentHandle> {
        self.framebuffers
            .get(&framebuffer.0)
            .and_then(|stored| stored.attachments.get(&slot).copied())
    }

    /// Texels of an image, row-major from the bottom-left
    pub fn read_image(&self, image: ImageHandle) -> Option<&[Vec4]> {
        self.images.get(&image.0).map(|stored| stored.texels.as_slice())
    }

    /// Replace every texel of an image
    pub fn write_texels(&mut self, image: ImageHandle, texels: &[Vec4]) {
        match self.images.get_mut(&image.0) {
            Some(stored) if stored.texels.len() == texels.len() => {
                stored.texels.copy_from_slice(texels);
            }
            Some(stored) => log::warn!(
                "HeadlessBackend: texel count {} does not match image {:?} ({} texels)",
                texels.len(),
                image,
                stored.texels.len()
            ),
            None => log::warn!("HeadlessBackend: write to unknown image {:?}", image),
        }
    }

    /// Texels of the display surface
    pub fn read_display(&self) -> &[Vec4] {
        &self.display
    }

    pub fn bound_read_target(&self) -> Option<FramebufferHandle> {
        self.read_target
    }

    pub fn bound_draw_target(&self) -> Option<FramebufferHandle> {
        self.draw_target
    }

    pub fn bound_images(&self) -> &BTreeMap<u32, ImageHandle> {
        &self.bound_images
    }

    fn store_of(&self, handle: AttachmentHandle) -> Option<&StoredImage> {
        match handle {
            AttachmentHandle::Image(image) => self.images.get(&image.0),
            AttachmentHandle::Renderbuffer(rb) => self.renderbuffers.get(&rb.0),
        }
    }

    fn store_of_mut(&mut self, handle: AttachmentHandle) -> Option<&mut StoredImage> {
        match handle {
            AttachmentHandle::Image(image) => self.images.get_mut(&image.0),
            AttachmentHandle::Renderbuffer(rb) => self.renderbuffers.get_mut(&rb.0),
        }
    }

    /// Snapshot a target's color plane (framebuffer slot or display) as width, height, texels
    fn read_color_plane(
        &self,
        target: Option<FramebufferHandle>,
        slot: AttachmentSlot,
    ) -> Option<(u32, u32, Vec<Vec4>)> {
        match target {
            None => Some((self.surface_width, self.surface_height, self.display.clone())),
            Some(fb) => {
                let handle = *self.framebuffers.get(&fb.0)?.attachments.get(&slot)?;
                let store = self.store_of(handle)?;
                Some((store.desc.width, store.desc.height, store.texels.clone()))
            }
        }
    }

    fn read_depth_plane(&self, target: Option<FramebufferHandle>) -> Option<(u32, u32, Vec<Vec4>)> {
        let framebuffer = self.framebuffers.get(&target?.0)?;
        let handle = framebuffer
            .attachments
            .iter()
            .find(|(slot, _)| slot.holds_depth())
            .map(|(_, handle)| *handle)?;
        let store = self.store_of(handle)?;
        Some((store.desc.width, store.desc.height, store.texels.clone()))
    }

    fn depth_handle(&self, target: Option<FramebufferHandle>) -> Option<AttachmentHandle> {
        self.framebuffers
            .get(&target?.0)?
            .attachments
            .iter()
            .find(|(slot, _)| slot.holds_depth())
            .map(|(_, handle)| *handle)
    }

    fn write_plane(
        &mut self,
        target: Option<FramebufferHandle>,
        handle: Option<AttachmentHandle>,
        dst: IRect,
        src: IRect,
        source: &(u32, u32, Vec<Vec4>),
        filter: FilterMode,
    ) {
        let (dst_width, dst_height, texels) = match (target, handle) {
            (None, _) => (self.surface_width, self.surface_height, &mut self.display),
            (Some(_), Some(handle)) => {
                let Some(store) = self.store_of_mut(handle) else {
                    return;
                };
                (store.desc.width, store.desc.height, &mut store.texels)
            }
            (Some(_), None) => return,
        };

        let (src_width, src_height, src_texels) = source;
        let scale_x = src.width() as f32 / dst.width() as f32;
        let scale_y = src.height() as f32 / dst.height() as f32;

        for y in dst.y0.max(0)..dst.y1.min(dst_height as i32) {
            for x in dst.x0.max(0)..dst.x1.min(dst_width as i32) {
                let u = src.x0 as f32 + (x - dst.x0) as f32 * scale_x + 0.5 * scale_x;
                let v = src.y0 as f32 + (y - dst.y0) as f32 * scale_y + 0.5 * scale_y;
                let texel = match filter {
                    FilterMode::Nearest => sample_nearest(src_texels, *src_width, *src_height, u, v),
                    FilterMode::Linear => sample_linear(src_texels, *src_width, *src_height, u, v),
                };
                texels[(y as usize) * (dst_width as usize) + x as usize] = texel;
            }
        }
    }

    fn clear_store(&mut self, handle: AttachmentHandle, value: Vec4) {
        if let Some(store) = self.store_of_mut(handle) {
            store.texels.fill(value);
        }
    }
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

fn sample_nearest(texels: &[Vec4], width: u32, height: u32, u: f32, v: f32) -> Vec4 {
    let x = (u.floor() as i64).clamp(0, width as i64 - 1) as usize;
    let y = (v.floor() as i64).clamp(0, height as i64 - 1) as usize;
    texels[y * width as usize + x]
}

fn sample_linear(texels: &[Vec4], width: u32, height: u32, u: f32, v: f32) -> Vec4 {
    let fx = u - 0.5;
    let fy = v - 0.5;
    let x0 = fx.floor();
    let y0 = fy.floor();
    let tx = fx - x0;
    let ty = fy - y0;
    let fetch = |x: f32, y: f32| {
        let x = (x as i64).clamp(0, width as i64 - 1) as usize;
        let y = (y as i64).clamp(0, height as i64 - 1) as usize;
        texels[y * width as usize + x]
    };
    let top = fetch(x0, y0).lerp(fetch(x0 + 1.0, y0), tx);
    let bottom = fetch(x0, y0 + 1.0).lerp(fetch(x0 + 1.0, y0 + 1.0), tx);
    top.lerp(bottom, ty)
}

/// IEEE half to single precision
fn half_to_f32(bits: u16) -> f32 {
    let sign = if bits & 0x8000 != 0 { -1.0 } else { 1.0 };
    let exponent = ((bits >> 10) & 0x1f) as i32;
    let mantissa = (bits & 0x3ff) as f32;
    match exponent {
        0 => sign * mantissa * 2f32.powi(-24),
        0x1f if mantissa == 0.0 => sign * f32::INFINITY,
        0x1f => f32::NAN,
        _ => sign * (1.0 + mantissa / 1024.0) * 2f32.powi(exponent - 15),
    }
}

fn decode_texels(format: TextureFormat, data: &[u8]) -> Option<Vec<Vec4>> {
    let stride = format.bytes_per_pixel() as usize;
    let texels = data
        .chunks_exact(stride)
        .map(|chunk| match format {
            TextureFormat::Rgba8 => Vec4::new(
                chunk[0] as f32 / 255.0,
                chunk[1] as f32 / 255.0,
                chunk[2] as f32 / 255.0,
                chunk[3] as f32 / 255.0,
            ),
            TextureFormat::Rgb8 => Vec4::new(
                chunk[0] as f32 / 255.0,
                chunk[1] as f32 / 255.0,
                chunk[2] as f32 / 255.0,
                1.0,
            ),
            TextureFormat::Rg8 => {
                Vec4::new(chunk[0] as f32 / 255.0, chunk[1] as f32 / 255.0, 0.0, 1.0)
            }
            TextureFormat::R8 => Vec4::new(chunk[0] as f32 / 255.0, 0.0, 0.0, 1.0),
            TextureFormat::Rgb16Float | TextureFormat::Rgba16Float => {
                let mut channels = [0.0, 0.0, 0.0, 1.0];
                for (i, half) in chunk.chunks_exact(2).enumerate() {
                    channels[i] = half_to_f32(u16::from_le_bytes([half[0], half[1]]));
                }
                Vec4::from_array(channels)
            }
            TextureFormat::Depth32 => {
                let depth = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                Vec4::new(depth, 0.0, 0.0, 0.0)
            }
            _ => Vec4::ZERO,
        })
        .collect::<Vec<_>>();

    match format {
        TextureFormat::Rgb10
        | TextureFormat::Depth16
        | TextureFormat::Depth24
        | TextureFormat::Depth24Stencil8
        | TextureFormat::Stencil4
        | TextureFormat::Stencil8
        | TextureFormat::Stencil16 => None,
        _ => Some(texels),
    }
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "Headless"
    }

    fn max_samples(&self) -> u32 {
        self.max_samples
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_width, self.surface_height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        log::trace!("HeadlessBackend: resizing surface to {}x{}", width, height);
        self.surface_width = width;
        self.surface_height = height;
        self.display = vec![Vec4::ZERO; (width as usize) * (height as usize)];
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        log::trace!("HeadlessBackend: begin frame {}", self.frames_presented);
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.frames_presented += 1;
        log::trace!("HeadlessBackend: presented frame {}", self.frames_presented);
        Ok(())
    }

    fn create_framebuffer(&mut self, label: Option<&str>) -> BackendResult<FramebufferHandle> {
        let id = self.next_handle();
        log::trace!("HeadlessBackend: creating framebuffer {} {:?}", id, label);
        self.framebuffers.insert(
            id,
            StoredFramebuffer {
                label: label.map(str::to_string),
                ..Default::default()
            },
        );
        self.counters.framebuffers_created += 1;
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer.0).is_some() {
            log::trace!("HeadlessBackend: destroying framebuffer {}", framebuffer.0);
            self.counters.framebuffers_destroyed += 1;
            if self.read_target == Some(framebuffer) {
                self.read_target = None;
            }
            if self.draw_target == Some(framebuffer) {
                self.draw_target = None;
            }
        }
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized image {:?}",
                desc.label
            )));
        }
        let id = self.next_handle();
        log::trace!(
            "HeadlessBackend: creating image {} {:?} ({}x{}, {:?}, {} samples)",
            id,
            desc.label,
            desc.width,
            desc.height,
            desc.format,
            desc.samples
        );
        self.images.insert(id, StoredImage::new(desc));
        self.counters.images_created += 1;
        Ok(ImageHandle(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if self.images.remove(&image.0).is_some() {
            log::trace!("HeadlessBackend: destroying image {}", image.0);
            self.counters.images_destroyed += 1;
            self.bound_images.retain(|_, bound| *bound != image);
        }
    }

    fn write_image(&mut self, image: ImageHandle, data: &[u8]) {
        let Some(stored) = self.images.get_mut(&image.0) else {
            log::warn!("HeadlessBackend: write to unknown image {:?}", image);
            return;
        };
        let expected = stored.texels.len() * stored.desc.format.bytes_per_pixel() as usize;
        if data.len() != expected {
            log::warn!(
                "HeadlessBackend: image {:?} expects {} bytes, got {}",
                image,
                expected,
                data.len()
            );
            return;
        }
        match decode_texels(stored.desc.format, data) {
            Some(texels) => stored.texels = texels,
            None => log::warn!(
                "HeadlessBackend: uploads to {:?} images are not simulated",
                stored.desc.format
            ),
        }
    }

    fn create_renderbuffer(
        &mut self,
        desc: &ImageDescriptor,
    ) -> BackendResult<RenderbufferHandle> {
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized renderbuffer {:?}",
                desc.label
            )));
        }
        let id = self.next_handle();
        log::trace!(
            "HeadlessBackend: creating renderbuffer {} ({}x{}, {:?})",
            id,
            desc.width,
            desc.height,
            desc.format
        );
        self.renderbuffers.insert(id, StoredImage::new(desc));
        self.counters.renderbuffers_created += 1;
        Ok(RenderbufferHandle(id))
    }

    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferHandle) {
        if self.renderbuffers.remove(&renderbuffer.0).is_some() {
            log::trace!("HeadlessBackend: destroying renderbuffer {}", renderbuffer.0);
            self.counters.renderbuffers_destroyed += 1;
        }
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferHandle,
        slot: AttachmentSlot,
        attachment: Option<AttachmentHandle>,
    ) {
        let Some(stored) = self.framebuffers.get_mut(&framebuffer.0) else {
            log::warn!("HeadlessBackend: attach to unknown framebuffer {:?}", framebuffer);
            return;
        };
        match attachment {
            Some(handle) => {
                stored.attachments.insert(slot, handle);
            }
            None => {
                stored.attachments.remove(&slot);
            }
        }
    }

    fn set_draw_slots(&mut self, framebuffer: FramebufferHandle, slots: &[AttachmentSlot]) {
        if let Some(stored) = self.framebuffers.get_mut(&framebuffer.0) {
            stored.draw_slots = slots.to_vec();
        }
    }

    fn check_completeness(
        &mut self,
        framebuffer: FramebufferHandle,
    ) -> Result<(), CompletenessError> {
        let Some(stored) = self.framebuffers.get(&framebuffer.0) else {
            return Err(CompletenessError::Unknown);
        };
        let attachments: Vec<_> = stored
            .attachments
            .iter()
            .map(|(slot, handle)| (*slot, self.store_of(*handle).map(StoredImage::info)))
            .collect();
        completeness::evaluate(&attachments, &stored.draw_slots, |_| true)
    }

    fn set_framebuffer_label(&mut self, framebuffer: FramebufferHandle, label: &str) {
        if let Some(stored) = self.framebuffers.get_mut(&framebuffer.0) {
            stored.label = Some(label.to_string());
        }
    }

    fn set_attachment_label(&mut self, attachment: AttachmentHandle, label: &str) {
        if let Some(store) = self.store_of_mut(attachment) {
            store.label = Some(label.to_string());
        }
    }

    fn bind_framebuffer(&mut self, mode: BindMode, framebuffer: Option<FramebufferHandle>) {
        log::trace!("HeadlessBackend: bind {:?} for {:?}", framebuffer, mode);
        if mode.includes_read() {
            self.read_target = framebuffer;
        }
        if mode.includes_draw() {
            self.draw_target = framebuffer;
        }
        self.commands.push(Command::BindFramebuffer { mode, framebuffer });
    }

    fn blit(&mut self, desc: &BlitDescriptor) {
        let read = self.read_target;
        let draw = self.draw_target;
        log::trace!("HeadlessBackend: blit {:?} -> {:?} ({:?})", read, draw, desc.buffers);
        self.commands.push(Command::Blit {
            read,
            draw,
            desc: *desc,
        });

        if desc.src.width() <= 0 || desc.src.height() <= 0 || desc.dst.width() <= 0 || desc.dst.height() <= 0 {
            log::warn!("HeadlessBackend: mirrored or empty blit regions are not simulated");
            return;
        }

        if desc.buffers.contains(BufferFlags::COLOR) {
            if let Some(source) = self.read_color_plane(read, desc.color_slot) {
                let handle = draw.and_then(|fb| {
                    self.framebuffers
                        .get(&fb.0)
                        .and_then(|stored| stored.attachments.get(&desc.color_slot).copied())
                });
                self.write_plane(draw, handle, desc.dst, desc.src, &source, desc.filter);
            }
        }

        if desc.buffers.intersects(BufferFlags::DEPTH | BufferFlags::STENCIL) {
            if let (Some(source), Some(handle)) = (self.read_depth_plane(read), self.depth_handle(draw)) {
                // depth never filters linearly
                self.write_plane(draw, Some(handle), desc.dst, desc.src, &source, FilterMode::Nearest);
            }
        }
    }

    fn set_viewport(&mut self, rect: IRect) {
        self.viewport = rect;
        self.commands.push(Command::SetViewport(rect));
    }

    fn set_clear_color(&mut self, color: Vec4) {
        self.clear_color = color;
    }

    fn clear(&mut self, buffers: BufferFlags) {
        let target = self.draw_target;
        self.commands.push(Command::Clear {
            framebuffer: target,
            buffers,
            color: self.clear_color,
        });

        let Some(fb) = target else {
            if buffers.contains(BufferFlags::COLOR) {
                self.display.fill(self.clear_color);
            }
            return;
        };
        let Some(stored) = self.framebuffers.get(&fb.0) else {
            return;
        };
        let mut color_targets = Vec::new();
        let mut depth_targets = Vec::new();
        for (slot, handle) in &stored.attachments {
            if slot.is_color() && stored.draw_slots.contains(slot) {
                color_targets.push(*handle);
            } else if slot.holds_depth() {
                depth_targets.push(*handle);
            }
        }
        if buffers.contains(BufferFlags::COLOR) {
            let color = self.clear_color;
            for handle in color_targets {
                self.clear_store(handle, color);
            }
        }
        if buffers.contains(BufferFlags::DEPTH) {
            for handle in depth_targets {
                self.clear_store(handle, Vec4::new(CLEAR_DEPTH, 0.0, 0.0, 0.0));
            }
        }
    }

    fn set_depth_test(&mut self, enabled: bool) {
        self.depth_test = enabled;
        self.commands.push(Command::SetDepthTest(enabled));
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        self.cull_mode = mode;
        self.commands.push(Command::SetCullMode(mode));
    }

    fn set_blend_state(&mut self, state: Option<BlendState>) {
        self.blend = state;
        self.commands.push(Command::SetBlendState(state));
    }

    fn create_shader(&mut self, desc: &ShaderDescriptor<'_>) -> BackendResult<ShaderHandle> {
        if desc.source.trim().is_empty() {
            return Err(BackendError::ShaderCreationFailed {
                label: desc.label.to_string(),
                message: "empty source".into(),
            });
        }
        let id = self.next_handle();
        log::trace!("HeadlessBackend: creating shader {} '{}'", id, desc.label);
        self.shaders.insert(
            id,
            StoredShader {
                label: desc.label.to_string(),
                uniforms: HashMap::new(),
            },
        );
        Ok(ShaderHandle(id))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
        if self.current_shader == Some(shader) {
            self.current_shader = None;
        }
    }

    fn use_shader(&mut self, shader: Option<ShaderHandle>) {
        self.current_shader = shader;
        self.commands.push(Command::UseShader(shader));
    }

    fn set_uniform(&mut self, shader: ShaderHandle, name: &str, value: UniformValue) {
        let Some(stored) = self.shaders.get_mut(&shader.0) else {
            log::warn!("HeadlessBackend: uniform '{}' set on unknown shader {:?}", name, shader);
            return;
        };
        stored.uniforms.insert(name.to_string(), value);
        self.commands.push(Command::SetUniform {
            shader,
            name: name.to_string(),
            value,
        });
    }

    fn bind_image(&mut self, slot: u32, image: Option<ImageHandle>) {
        match image {
            Some(image) => {
                self.bound_images.insert(slot, image);
            }
            None => {
                self.bound_images.remove(&slot);
            }
        }
        self.commands.push(Command::BindImage { slot, image });
    }

    fn create_mesh(&mut self, desc: &MeshDescriptor<'_>) -> BackendResult<MeshHandle> {
        let id = self.next_handle();
        log::trace!(
            "HeadlessBackend: creating mesh {} '{}' ({} indices)",
            id,
            desc.label,
            desc.indices.len()
        );
        self.meshes.insert(
            id,
            StoredMesh {
                label: desc.label.to_string(),
                index_count: desc.indices.len(),
            },
        );
        Ok(MeshHandle(id))
    }

    fn destroy_mesh(&mut self, mesh: MeshHandle) {
        self.meshes.remove(&mesh.0);
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        if !self.meshes.contains_key(&mesh.0) {
            log::warn!("HeadlessBackend: draw of unknown mesh {:?}", mesh);
            return;
        }
        self.commands.push(Command::Draw(DrawRecord {
            framebuffer: self.draw_target,
            shader: self.current_shader,
            mesh,
            viewport: self.viewport,
            depth_test: self.depth_test,
            cull_mode: self.cull_mode,
            blend: self.blend,
            images: self.bound_images.clone(),
        }));
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_image(backend: &mut HeadlessBackend, width: u32, height: u32) -> ImageHandle {
        backend
            .create_image(&ImageDescriptor {
                width,
                height,
                format: TextureFormat::Rgba8,
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_clear_fills_draw_slots() {
        let mut backend = HeadlessBackend::new(4, 4);
        let fb = backend.create_framebuffer(None).unwrap();
        let image = color_image(&mut backend, 2, 2);
        backend.attach(fb, AttachmentSlot::Color0, Some(AttachmentHandle::Image(image)));
        backend.set_draw_slots(fb, &[AttachmentSlot::Color0]);

        backend.bind_framebuffer(BindMode::Draw, Some(fb));
        backend.set_clear_color(Vec4::new(0.25, 0.5, 0.75, 1.0));
        backend.clear(BufferFlags::COLOR);

        assert!(backend
            .read_image(image)
            .unwrap()
            .iter()
            .all(|t| *t == Vec4::new(0.25, 0.5, 0.75, 1.0)));
    }

    #[test]
    fn test_nearest_blit_upscales_to_display() {
        let mut backend = HeadlessBackend::new(4, 4);
        let fb = backend.create_framebuffer(None).unwrap();
        let image = color_image(&mut backend, 2, 2);
        backend.attach(fb, AttachmentSlot::Color0, Some(AttachmentHandle::Image(image)));
        let texels = [Vec4::X, Vec4::Y, Vec4::Z, Vec4::W];
        backend.write_texels(image, &texels);

        backend.bind_framebuffer(BindMode::Read, Some(fb));
        backend.bind_framebuffer(BindMode::Draw, None);
        backend.blit(&BlitDescriptor {
            src: IRect::from_size(2, 2),
            dst: IRect::from_size(4, 4),
            buffers: BufferFlags::ALL,
            filter: FilterMode::Nearest,
            color_slot: AttachmentSlot::Color0,
        });

        let display = backend.read_display();
        assert_eq!(display[0], Vec4::X);
        assert_eq!(display[3], Vec4::Y);
        assert_eq!(display[12], Vec4::Z);
        assert_eq!(display[15], Vec4::W);
    }

    #[test]
    fn test_uniforms_persist_per_program() {
        let mut backend = HeadlessBackend::default();
        let a = backend
            .create_shader(&ShaderDescriptor { label: "a", source: "fn vs_main() {}" })
            .unwrap();
        let b = backend
            .create_shader(&ShaderDescriptor { label: "b", source: "fn vs_main() {}" })
            .unwrap();
        backend.set_uniform(a, "a_Exposure", UniformValue::Float(2.0));
        backend.set_uniform(b, "a_Exposure", UniformValue::Float(0.5));
        assert_eq!(backend.uniform(a, "a_Exposure"), Some(UniformValue::Float(2.0)));
        assert_eq!(backend.uniform(b, "a_Exposure"), Some(UniformValue::Float(0.5)));
    }

    #[test]
    fn test_write_image_decodes_rgb8() {
        let mut backend = HeadlessBackend::default();
        let image = backend
            .create_image(&ImageDescriptor {
                width: 1,
                height: 1,
                format: TextureFormat::Rgb8,
                ..Default::default()
            })
            .unwrap();
        backend.write_image(image, &[255, 0, 51]);
        let texel = backend.read_image(image).unwrap()[0];
        assert!((texel - Vec4::new(1.0, 0.0, 0.2, 1.0)).abs().max_element() < 1e-6);
    }

    #[test]
    fn test_half_float_decoding() {
        assert_eq!(half_to_f32(0x3c00), 1.0);
        assert_eq!(half_to_f32(0xc000), -2.0);
        assert_eq!(half_to_f32(0x0000), 0.0);
    }
}
