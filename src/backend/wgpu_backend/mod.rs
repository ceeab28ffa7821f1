//! wgpu backend implementation
//!
//! Device commands are recorded while the stages run and encoded into the frame's command
//! encoder when the frame ends (or before an overlay renders). Consecutive draws into the
//! same framebuffer share one render pass; a clear issued before its first draw becomes
//! the pass's load operation.

mod blit;
mod reflection;

pub use reflection::{ShaderReflection, SlotKind, UniformMember};

use self::blit::{BlitPipelines, DepthResolvePipelines, PreparedBlit};
use crate::backend::completeness::{self, AttachmentInfo, CompletenessError};
use crate::backend::traits::*;
use crate::backend::types::*;
use glam::Vec4;
use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroU64;
use std::sync::Arc;
use wgpu::util::DeviceExt;

/// Texture behind an image or renderbuffer handle
struct GpuStore {
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    /// Depth-only view of combined depth-stencil images
    depth_view: Option<wgpu::TextureView>,
    desc: ImageDescriptor,
    format: wgpu::TextureFormat,
    sampled: bool,
}

impl GpuStore {
    fn info(&self) -> AttachmentInfo {
        AttachmentInfo {
            format: self.desc.format,
            width: self.desc.width,
            height: self.desc.height,
            samples: self.desc.samples,
        }
    }

    fn size(&self) -> (u32, u32) {
        (self.desc.width, self.desc.height)
    }

    fn sample_view(&self) -> &wgpu::TextureView {
        self.depth_view.as_ref().unwrap_or(&self.view)
    }
}

#[derive(Default)]
struct GpuFramebuffer {
    label: Option<String>,
    attachments: BTreeMap<AttachmentSlot, AttachmentHandle>,
    draw_slots: Vec<AttachmentSlot>,
}

struct GpuShader {
    label: String,
    module: wgpu::ShaderModule,
    reflection: ShaderReflection,
    /// CPU copy of the uniform block, snapshotted into the frame arena on every draw
    uniforms: Vec<u8>,
    uniform_layout: wgpu::BindGroupLayout,
    texture_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
}

struct GpuMesh {
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    index_count: u32,
    layout: VertexBufferLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PipelineKey {
    shader: u64,
    colors: Vec<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
    samples: u32,
    blend: Option<BlendState>,
    depth_test: bool,
    cull_mode: CullMode,
    layout: VertexBufferLayout,
}

#[derive(Debug, Clone)]
struct RecordedDraw {
    shader: u64,
    mesh: u64,
    viewport: IRect,
    uniform_offset: u32,
    /// Texture slot to image, and whether the draw reads a snapshot of it
    images: BTreeMap<u32, (ImageHandle, bool)>,
    blend: Option<BlendState>,
    depth_test: bool,
    cull_mode: CullMode,
}

#[derive(Debug, Clone)]
struct PassRecord {
    target: Option<FramebufferHandle>,
    clear_color: Option<Vec4>,
    clear_depth: bool,
    clear_stencil: bool,
    draws: Vec<RecordedDraw>,
}

#[derive(Debug, Clone)]
enum Segment {
    Pass(PassRecord),
    Blit {
        read: Option<FramebufferHandle>,
        draw: Option<FramebufferHandle>,
        desc: BlitDescriptor,
    },
    /// Copy an image that a following draw both samples and renders into
    Snapshot(ImageHandle),
}

/// Attachment layout of a pass target
struct TargetFormats {
    colors: Vec<wgpu::TextureFormat>,
    depth: Option<wgpu::TextureFormat>,
    samples: u32,
    size: (u32, u32),
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    surface: wgpu::Surface<'static>,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,
    surface_config: wgpu::SurfaceConfiguration,
    current_texture: Option<wgpu::SurfaceTexture>,
    encoder: Option<wgpu::CommandEncoder>,

    // Resource storage; images and renderbuffers share the id space
    stores: HashMap<u64, GpuStore>,
    framebuffers: HashMap<u64, GpuFramebuffer>,
    shaders: HashMap<u64, GpuShader>,
    meshes: HashMap<u64, GpuMesh>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    snapshots: HashMap<u64, GpuStore>,
    next_id: u64,

    // Bound state
    draw_target: Option<FramebufferHandle>,
    read_target: Option<FramebufferHandle>,
    viewport: IRect,
    clear_color: Vec4,
    depth_test: bool,
    cull_mode: CullMode,
    blend: Option<BlendState>,
    current_shader: Option<ShaderHandle>,
    bound_images: BTreeMap<u32, ImageHandle>,

    // Recorded frame
    segments: Vec<Segment>,
    uniform_arena: Vec<u8>,
    uniform_alignment: usize,
    uniform_buffer: wgpu::Buffer,

    blit: BlitPipelines,
    depth_resolve: DepthResolvePipelines,
    linear_sampler: wgpu::Sampler,
    nearest_sampler: wgpu::Sampler,
    fallback_color: wgpu::TextureView,
    fallback_depth: wgpu::TextureView,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> Option<wgpu::TextureFormat> {
        match format {
            TextureFormat::Rgba8 | TextureFormat::Rgb8 => Some(wgpu::TextureFormat::Rgba8Unorm),
            TextureFormat::Rgb10 => Some(wgpu::TextureFormat::Rgb10a2Unorm),
            TextureFormat::Rg8 => Some(wgpu::TextureFormat::Rg8Unorm),
            TextureFormat::R8 => Some(wgpu::TextureFormat::R8Unorm),
            TextureFormat::Rgb16Float | TextureFormat::Rgba16Float => {
                Some(wgpu::TextureFormat::Rgba16Float)
            }
            TextureFormat::Depth24Stencil8 => Some(wgpu::TextureFormat::Depth24PlusStencil8),
            TextureFormat::Depth16 => Some(wgpu::TextureFormat::Depth16Unorm),
            TextureFormat::Depth24 => Some(wgpu::TextureFormat::Depth24Plus),
            TextureFormat::Depth32 => Some(wgpu::TextureFormat::Depth32Float),
            TextureFormat::Stencil8 => Some(wgpu::TextureFormat::Stencil8),
            TextureFormat::Stencil4 | TextureFormat::Stencil16 => None,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_state(state: BlendState) -> wgpu::BlendState {
        let component = |c: BlendComponent| wgpu::BlendComponent {
            src_factor: Self::convert_blend_factor(c.src_factor),
            dst_factor: Self::convert_blend_factor(c.dst_factor),
            operation: Self::convert_blend_operation(c.operation),
        };
        wgpu::BlendState {
            color: component(state.color),
            alpha: component(state.alpha),
        }
    }

    fn convert_cull_mode(mode: CullMode) -> Option<wgpu::Face> {
        match mode {
            CullMode::None => None,
            CullMode::Front => Some(wgpu::Face::Front),
            CullMode::Back => Some(wgpu::Face::Back),
        }
    }

    fn convert_vertex_format(format: VertexFormat) -> wgpu::VertexFormat {
        match format {
            VertexFormat::Float32 => wgpu::VertexFormat::Float32,
            VertexFormat::Float32x2 => wgpu::VertexFormat::Float32x2,
            VertexFormat::Float32x3 => wgpu::VertexFormat::Float32x3,
            VertexFormat::Float32x4 => wgpu::VertexFormat::Float32x4,
        }
    }

    /// Clamp a surface size to device limits while keeping the aspect ratio
    fn clamp_to_limits(max_size: u32, width: u32, height: u32) -> (u32, u32) {
        if width > max_size || height > max_size {
            let scale = (max_size as f32 / width as f32).min(max_size as f32 / height as f32);
            (
                ((width as f32 * scale) as u32).max(1),
                ((height as f32 * scale) as u32).max(1),
            )
        } else {
            (width.max(1), height.max(1))
        }
    }
}

impl WgpuBackend {
    /// Create the device and configure the window's surface
    pub fn new(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(window, vsync))
    }

    pub async fn new_async(window: Arc<winit::window::Window>, vsync: bool) -> BackendResult<Self> {
        let (instance, surface, adapter, device, queue) = Self::init_native(window.clone()).await?;

        let size = window.inner_size();
        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .copied()
            .find(|f| f.is_srgb())
            .or_else(|| surface_caps.formats.first().copied())
            .ok_or_else(|| {
                BackendError::SurfaceCreationFailed("surface reports no formats".into())
            })?;

        let present_mode = if vsync {
            wgpu::PresentMode::AutoVsync
        } else {
            wgpu::PresentMode::AutoNoVsync
        };

        let max_size = device.limits().max_texture_dimension_2d;
        let (width, height) = Self::clamp_to_limits(max_size, size.width, size.height);

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width,
            height,
            present_mode,
            alpha_mode: surface_caps
                .alpha_modes
                .first()
                .copied()
                .unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: 2,
        };
        surface.configure(&device, &surface_config);

        let uniform_alignment = device.limits().min_uniform_buffer_offset_alignment as usize;
        let uniform_buffer = Self::create_uniform_buffer(&device, 64 * 1024);
        let blit = BlitPipelines::new(&device);
        let depth_resolve = DepthResolvePipelines::new(&device);
        let sampler = |filter: wgpu::FilterMode, label: &str| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                label: Some(label),
                address_mode_u: wgpu::AddressMode::ClampToEdge,
                address_mode_v: wgpu::AddressMode::ClampToEdge,
                mag_filter: filter,
                min_filter: filter,
                ..Default::default()
            })
        };
        let linear_sampler = sampler(wgpu::FilterMode::Linear, "Linear Sampler");
        let nearest_sampler = sampler(wgpu::FilterMode::Nearest, "Nearest Sampler");
        let fallback_color = Self::create_fallback(
            &device,
            &queue,
            wgpu::TextureFormat::Rgba8Unorm,
            "Fallback Color",
        );
        let fallback_depth = Self::create_fallback(
            &device,
            &queue,
            wgpu::TextureFormat::Depth32Float,
            "Fallback Depth",
        );
        Ok(Self {
            instance,
            surface,
            adapter,
            device,
            queue,
            surface_config,
            current_texture: None,
            encoder: None,
            stores: HashMap::new(),
            framebuffers: HashMap::new(),
            shaders: HashMap::new(),
            meshes: HashMap::new(),
            pipelines: HashMap::new(),
            snapshots: HashMap::new(),
            next_id: 1,
            draw_target: None,
            read_target: None,
            viewport: IRect::from_size(width, height),
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            depth_test: false,
            cull_mode: CullMode::None,
            blend: None,
            current_shader: None,
            bound_images: BTreeMap::new(),
            segments: Vec::new(),
            uniform_arena: Vec::new(),
            uniform_alignment: uniform_alignment.max(16),
            uniform_buffer,
            blit,
            depth_resolve,
            linear_sampler,
            nearest_sampler,
            fallback_color,
            fallback_depth,
        })
    }

    async fn init_native(
        window: Arc<winit::window::Window>,
    ) -> BackendResult<(
        wgpu::Instance,
        wgpu::Surface<'static>,
        wgpu::Adapter,
        wgpu::Device,
        wgpu::Queue,
    )> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance
            .create_surface(window)
            .map_err(|e| BackendError::SurfaceCreationFailed(e.to_string()))?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Graphics Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;
        device.on_uncaptured_error(Box::new(|error| {
            log::error!("wgpu validation error: {}", error);
        }));

        Ok((instance, surface, adapter, device, queue))
    }

    fn create_uniform_buffer(device: &wgpu::Device, size: u64) -> wgpu::Buffer {
        device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Uniform Arena"),
            size,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })
    }

    /// 1x1 texture bound to slots a program declares but nothing fills
    fn create_fallback(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        format: wgpu::TextureFormat,
        label: &str,
    ) -> wgpu::TextureView {
        let is_depth = format.has_depth_aspect();
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: 1,
                height: 1,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING
                | wgpu::TextureUsages::COPY_DST
                | wgpu::TextureUsages::RENDER_ATTACHMENT,
            view_formats: &[],
        });
        if !is_depth {
            queue.write_texture(
                texture.as_image_copy(),
                &[0, 0, 0, 255],
                wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(4),
                    rows_per_image: None,
                },
                wgpu::Extent3d {
                    width: 1,
                    height: 1,
                    depth_or_array_layers: 1,
                },
            );
        }
        texture.create_view(&wgpu::TextureViewDescriptor::default())
    }

    fn next_handle(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_store(&mut self, desc: &ImageDescriptor, sampled: bool) -> BackendResult<u64> {
        let format = Self::convert_texture_format(desc.format).ok_or_else(|| {
            BackendError::TextureCreationFailed(format!("{:?} is not supported", desc.format))
        })?;
        if desc.width == 0 || desc.height == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "zero-sized image {:?}",
                desc.label
            )));
        }
        let max_size = self.device.limits().max_texture_dimension_2d;
        if desc.width > max_size || desc.height > max_size {
            return Err(BackendError::TextureCreationFailed(format!(
                "{}x{} exceeds the device limit of {}",
                desc.width, desc.height, max_size
            )));
        }

        let samples = desc.samples.max(1);
        let sampled = sampled && samples == 1;
        // Multisampled depth is read by the resolve pass
        let resolvable = samples > 1 && format.has_depth_aspect();
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if samples == 1 {
            usage |= wgpu::TextureUsages::COPY_SRC | wgpu::TextureUsages::COPY_DST;
        }
        if sampled || resolvable {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: samples,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let depth_view = ((sampled || resolvable)
            && format.has_depth_aspect()
            && format.has_stencil_aspect())
            .then(|| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    aspect: wgpu::TextureAspect::DepthOnly,
                    ..Default::default()
                })
            });

        let id = self.next_handle();
        self.stores.insert(
            id,
            GpuStore {
                texture,
                view,
                depth_view,
                desc: desc.clone(),
                format,
                sampled,
            },
        );
        Ok(id)
    }

    fn store_id(handle: AttachmentHandle) -> u64 {
        match handle {
            AttachmentHandle::Image(image) => image.0,
            AttachmentHandle::Renderbuffer(renderbuffer) => renderbuffer.0,
        }
    }

    fn depth_attachment(framebuffer: &GpuFramebuffer) -> Option<u64> {
        [
            AttachmentSlot::DepthStencil,
            AttachmentSlot::Depth,
            AttachmentSlot::Stencil,
        ]
        .iter()
        .find_map(|slot| framebuffer.attachments.get(slot).copied())
        .map(Self::store_id)
    }

    fn target_formats(&self, target: Option<FramebufferHandle>) -> Option<TargetFormats> {
        let Some(target) = target else {
            return Some(TargetFormats {
                colors: vec![self.surface_config.format],
                depth: None,
                samples: 1,
                size: (self.surface_config.width, self.surface_config.height),
            });
        };
        let framebuffer = self.framebuffers.get(&target.0)?;
        let mut colors = Vec::new();
        let mut size = None;
        let mut samples = 1;
        for slot in &framebuffer.draw_slots {
            let store = self
                .stores
                .get(&Self::store_id(*framebuffer.attachments.get(slot)?))?;
            colors.push(store.format);
            size.get_or_insert(store.size());
            samples = store.desc.samples.max(1);
        }
        let depth = Self::depth_attachment(framebuffer).and_then(|id| self.stores.get(&id));
        if let Some(depth) = depth {
            size.get_or_insert(depth.size());
            samples = depth.desc.samples.max(1);
        }
        Some(TargetFormats {
            colors,
            depth: depth.map(|store| store.format),
            samples,
            size: size?,
        })
    }

    fn completeness(&self, framebuffer: FramebufferHandle) -> Result<(), CompletenessError> {
        let Some(stored) = self.framebuffers.get(&framebuffer.0) else {
            return Err(CompletenessError::Unknown);
        };
        let attachments: Vec<_> = stored
            .attachments
            .iter()
            .map(|(slot, handle)| {
                (
                    *slot,
                    self.stores.get(&Self::store_id(*handle)).map(GpuStore::info),
                )
            })
            .collect();
        completeness::evaluate(&attachments, &stored.draw_slots, |format| {
            Self::convert_texture_format(format).is_some()
        })
    }

    /// Incomplete framebuffers are never handed to wgpu, whose validation would abort
    fn encodable(&self, target: Option<FramebufferHandle>, what: &str) -> bool {
        let Some(target) = target else {
            return true;
        };
        match self.completeness(target) {
            Ok(()) => true,
            Err(err) => {
                log::warn!("Skipping {} on framebuffer {:?}: {}", what, target, err);
                false
            }
        }
    }

    /// Last recorded pass if it draws into `target`, otherwise a new one
    fn open_pass(&mut self, target: Option<FramebufferHandle>) -> &mut PassRecord {
        let reuse = matches!(self.segments.last(), Some(Segment::Pass(pass)) if pass.target == target);
        if !reuse {
            self.segments.push(Segment::Pass(PassRecord {
                target,
                clear_color: None,
                clear_depth: false,
                clear_stencil: false,
                draws: Vec::new(),
            }));
        }
        match self.segments.last_mut() {
            Some(Segment::Pass(pass)) => pass,
            _ => unreachable!("a pass segment was just ensured"),
        }
    }

    /// Images attached to the bound draw target
    fn draw_target_images(&self) -> HashSet<u64> {
        self.draw_target
            .and_then(|target| self.framebuffers.get(&target.0))
            .map(|framebuffer| {
                framebuffer
                    .attachments
                    .values()
                    .filter_map(|handle| match handle {
                        AttachmentHandle::Image(image) => Some(image.0),
                        AttachmentHandle::Renderbuffer(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn pipeline_key(&self, draw: &RecordedDraw, formats: &TargetFormats) -> Option<PipelineKey> {
        let mesh = self.meshes.get(&draw.mesh)?;
        Some(PipelineKey {
            shader: draw.shader,
            colors: formats.colors.clone(),
            depth: formats.depth,
            samples: formats.samples,
            blend: draw.blend,
            depth_test: draw.depth_test,
            cull_mode: draw.cull_mode,
            layout: mesh.layout.clone(),
        })
    }

    fn ensure_pipeline(&mut self, key: &PipelineKey) -> bool {
        if self.pipelines.contains_key(key) {
            return true;
        }
        let Some(shader) = self.shaders.get(&key.shader) else {
            return false;
        };

        let attributes: Vec<wgpu::VertexAttribute> = key
            .layout
            .attributes
            .iter()
            .map(|attribute| wgpu::VertexAttribute {
                format: Self::convert_vertex_format(attribute.format),
                offset: attribute.offset,
                shader_location: attribute.location,
            })
            .collect();
        let buffers = [wgpu::VertexBufferLayout {
            array_stride: key.layout.array_stride,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &attributes,
        }];

        let targets: Vec<Option<wgpu::ColorTargetState>> = key
            .colors
            .iter()
            .enumerate()
            .map(|(location, format)| {
                let written = shader.reflection.outputs.contains(&(location as u32));
                Some(wgpu::ColorTargetState {
                    format: *format,
                    blend: key.blend.map(Self::convert_blend_state),
                    write_mask: if written {
                        wgpu::ColorWrites::ALL
                    } else {
                        wgpu::ColorWrites::empty()
                    },
                })
            })
            .collect();

        let depth_stencil = key.depth.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: key.depth_test && format.has_depth_aspect(),
            depth_compare: if key.depth_test {
                wgpu::CompareFunction::Less
            } else {
                wgpu::CompareFunction::Always
            },
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });

        let fragment = shader.reflection.has_fragment.then(|| wgpu::FragmentState {
            module: &shader.module,
            entry_point: "fs_main",
            compilation_options: Default::default(),
            targets: &targets,
        });

        log::debug!(
            "Creating pipeline for shader '{}' ({} color targets, depth {:?}, {} samples)",
            shader.label,
            key.colors.len(),
            key.depth,
            key.samples
        );
        let pipeline = self
            .device
            .create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&shader.label),
                layout: Some(&shader.pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader.module,
                    entry_point: "vs_main",
                    compilation_options: Default::default(),
                    buffers: &buffers,
                },
                fragment,
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    front_face: wgpu::FrontFace::Ccw,
                    cull_mode: Self::convert_cull_mode(key.cull_mode),
                    ..Default::default()
                },
                depth_stencil,
                multisample: wgpu::MultisampleState {
                    count: key.samples,
                    ..Default::default()
                },
                multiview: None,
            });
        self.pipelines.insert(key.clone(), pipeline);
        true
    }

    /// View bound to `slot` of a draw, or the fallback when nothing usable is bound
    fn slot_view(&self, kind: SlotKind, image: Option<&(ImageHandle, bool)>) -> &wgpu::TextureView {
        let fallback = match kind {
            SlotKind::Color => &self.fallback_color,
            SlotKind::Depth => &self.fallback_depth,
        };
        let Some((image, snapshot)) = image else {
            return fallback;
        };
        let store = if *snapshot {
            self.snapshots.get(&image.0)
        } else {
            self.stores.get(&image.0)
        };
        match store {
            Some(store)
                if store.sampled && store.format.has_depth_aspect() == (kind == SlotKind::Depth) =>
            {
                store.sample_view()
            }
            Some(_) => {
                log::debug!("Image {:?} cannot be sampled as {:?}, using fallback", image, kind);
                fallback
            }
            None => fallback,
        }
    }

    fn texture_bind_group(&self, draw: &RecordedDraw) -> Option<wgpu::BindGroup> {
        let shader = self.shaders.get(&draw.shader)?;
        let mut entries = Vec::new();
        for (slot, kind) in &shader.reflection.slots {
            entries.push(wgpu::BindGroupEntry {
                binding: slot * 2,
                resource: wgpu::BindingResource::TextureView(
                    self.slot_view(*kind, draw.images.get(slot)),
                ),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: slot * 2 + 1,
                resource: wgpu::BindingResource::Sampler(match kind {
                    SlotKind::Color => &self.linear_sampler,
                    SlotKind::Depth => &self.nearest_sampler,
                }),
            });
        }
        Some(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Texture Slots"),
            layout: &shader.texture_layout,
            entries: &entries,
        }))
    }

    fn upload_uniform_arena(&mut self) {
        if self.uniform_arena.is_empty() {
            return;
        }
        let needed = self.uniform_arena.len() as u64;
        if needed > self.uniform_buffer.size() {
            let size = needed.next_power_of_two();
            log::debug!("Growing uniform arena to {} bytes", size);
            self.uniform_buffer = Self::create_uniform_buffer(&self.device, size);
        }
        self.queue
            .write_buffer(&self.uniform_buffer, 0, &self.uniform_arena);
    }

    fn uniform_bind_group(&self, shader: &GpuShader) -> wgpu::BindGroup {
        match NonZeroU64::new(shader.reflection.uniform_size as u64) {
            Some(size) => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Uniform Block"),
                layout: &shader.uniform_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: &self.uniform_buffer,
                        offset: 0,
                        size: Some(size),
                    }),
                }],
            }),
            None => self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("Empty Uniform Block"),
                layout: &shader.uniform_layout,
                entries: &[],
            }),
        }
    }

    /// Encode every recorded segment into the frame encoder
    fn flush_commands(&mut self) {
        if self.segments.is_empty() {
            return;
        }
        let Some(surface_view) = self.current_texture.as_ref().map(|texture| {
            texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default())
        }) else {
            log::debug!("Dropping {} segments recorded outside a frame", self.segments.len());
            self.segments.clear();
            return;
        };
        let Some(mut encoder) = self.encoder.take() else {
            self.segments.clear();
            return;
        };

        self.upload_uniform_arena();
        let segments = std::mem::take(&mut self.segments);

        let mut uniform_groups: HashMap<u64, wgpu::BindGroup> = HashMap::new();
        for segment in &segments {
            if let Segment::Pass(pass) = segment {
                for draw in &pass.draws {
                    if !uniform_groups.contains_key(&draw.shader) {
                        if let Some(shader) = self.shaders.get(&draw.shader) {
                            uniform_groups.insert(draw.shader, self.uniform_bind_group(shader));
                        }
                    }
                }
            }
        }

        for segment in &segments {
            match segment {
                Segment::Pass(pass) => {
                    self.encode_pass(&mut encoder, &surface_view, pass, &uniform_groups)
                }
                Segment::Blit { read, draw, desc } => {
                    self.encode_blit(&mut encoder, &surface_view, *read, *draw, desc)
                }
                Segment::Snapshot(image) => self.encode_snapshot(&mut encoder, *image),
            }
        }

        self.encoder = Some(encoder);
    }

    fn encode_pass(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        surface_view: &wgpu::TextureView,
        pass: &PassRecord,
        uniform_groups: &HashMap<u64, wgpu::BindGroup>,
    ) {
        if !self.encodable(pass.target, "pass") {
            return;
        }
        let Some(formats) = self.target_formats(pass.target) else {
            log::warn!("Skipping pass into incomplete framebuffer {:?}", pass.target);
            return;
        };

        // Pipelines and bind groups are created before the pass borrows the device state
        let mut prepared = Vec::with_capacity(pass.draws.len());
        for draw in &pass.draws {
            let Some(key) = self.pipeline_key(draw, &formats) else {
                continue;
            };
            if !self.ensure_pipeline(&key) {
                continue;
            }
            let Some(textures) = self.texture_bind_group(draw) else {
                continue;
            };
            prepared.push((draw, key, textures));
        }

        let framebuffer = pass.target.and_then(|target| self.framebuffers.get(&target.0));
        let color_views: Vec<&wgpu::TextureView> = match framebuffer {
            Some(framebuffer) => framebuffer
                .draw_slots
                .iter()
                .filter_map(|slot| framebuffer.attachments.get(slot))
                .filter_map(|handle| self.stores.get(&Self::store_id(*handle)))
                .map(|store| &store.view)
                .collect(),
            None => vec![surface_view],
        };
        let color_load = match pass.clear_color {
            Some(color) => wgpu::LoadOp::Clear(wgpu::Color {
                r: color.x as f64,
                g: color.y as f64,
                b: color.z as f64,
                a: color.w as f64,
            }),
            None => wgpu::LoadOp::Load,
        };
        let color_attachments: Vec<Option<wgpu::RenderPassColorAttachment>> = color_views
            .iter()
            .map(|view| {
                Some(wgpu::RenderPassColorAttachment {
                    view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: color_load,
                        store: wgpu::StoreOp::Store,
                    },
                })
            })
            .collect();

        let depth_store = framebuffer
            .and_then(Self::depth_attachment)
            .and_then(|id| self.stores.get(&id));
        let depth_stencil_attachment =
            depth_store.map(|store| wgpu::RenderPassDepthStencilAttachment {
                view: &store.view,
                depth_ops: store.format.has_depth_aspect().then(|| wgpu::Operations {
                    load: if pass.clear_depth {
                        wgpu::LoadOp::Clear(1.0)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: store.format.has_stencil_aspect().then(|| wgpu::Operations {
                    load: if pass.clear_stencil {
                        wgpu::LoadOp::Clear(0)
                    } else {
                        wgpu::LoadOp::Load
                    },
                    store: wgpu::StoreOp::Store,
                }),
            });

        let label = framebuffer
            .and_then(|framebuffer| framebuffer.label.as_deref())
            .unwrap_or(if pass.target.is_none() { "Display" } else { "Framebuffer" });
        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let (width, height) = formats.size;
        for (draw, key, textures) in &prepared {
            let (Some(pipeline), Some(mesh), Some(shader)) = (
                self.pipelines.get(key),
                self.meshes.get(&draw.mesh),
                self.shaders.get(&draw.shader),
            ) else {
                continue;
            };
            let x0 = draw.viewport.x0.clamp(0, width as i32);
            let y0 = draw.viewport.y0.clamp(0, height as i32);
            let x1 = draw.viewport.x1.clamp(x0, width as i32);
            let y1 = draw.viewport.y1.clamp(y0, height as i32);
            if x1 == x0 || y1 == y0 {
                continue;
            }
            render_pass.set_viewport(
                x0 as f32,
                y0 as f32,
                (x1 - x0) as f32,
                (y1 - y0) as f32,
                0.0,
                1.0,
            );
            render_pass.set_pipeline(pipeline);
            if let Some(uniforms) = uniform_groups.get(&draw.shader) {
                if shader.reflection.uniform_size > 0 {
                    render_pass.set_bind_group(0, uniforms, &[draw.uniform_offset]);
                } else {
                    render_pass.set_bind_group(0, uniforms, &[]);
                }
            }
            render_pass.set_bind_group(1, textures, &[]);
            render_pass.set_vertex_buffer(0, mesh.vertex_buffer.slice(..));
            render_pass.set_index_buffer(mesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
            render_pass.draw_indexed(0..mesh.index_count, 0, 0..1);
        }
    }

    fn encode_snapshot(&mut self, encoder: &mut wgpu::CommandEncoder, image: ImageHandle) {
        let Some(source) = self.stores.get(&image.0) else {
            return;
        };
        let stale = self
            .snapshots
            .get(&image.0)
            .map_or(true, |snapshot| snapshot.desc != source.desc);
        if stale {
            let label = format!(
                "{}_Snapshot",
                source.desc.label.as_deref().unwrap_or("Image")
            );
            let texture = self.device.create_texture(&wgpu::TextureDescriptor {
                label: Some(&label),
                size: source.texture.size(),
                mip_level_count: 1,
                sample_count: 1,
                dimension: wgpu::TextureDimension::D2,
                format: source.format,
                usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
                view_formats: &[],
            });
            let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
            let format = source.format;
            self.snapshots.insert(
                image.0,
                GpuStore {
                    texture,
                    view,
                    depth_view: None,
                    desc: source.desc.clone(),
                    format,
                    sampled: true,
                },
            );
        }
        if let (Some(source), Some(snapshot)) =
            (self.stores.get(&image.0), self.snapshots.get(&image.0))
        {
            encoder.copy_texture_to_texture(
                source.texture.as_image_copy(),
                snapshot.texture.as_image_copy(),
                source.texture.size(),
            );
        }
    }

    fn encode_blit(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        surface_view: &wgpu::TextureView,
        read: Option<FramebufferHandle>,
        draw: Option<FramebufferHandle>,
        desc: &BlitDescriptor,
    ) {
        if !self.encodable(read, "blit") || !self.encodable(draw, "blit") {
            return;
        }
        let Some(read) = read.and_then(|read| self.framebuffers.get(&read.0)) else {
            log::warn!("Blit from the display surface is not supported");
            return;
        };
        let draw_framebuffer = draw.and_then(|draw| self.framebuffers.get(&draw.0));
        let same_size =
            desc.src.width() == desc.dst.width() && desc.src.height() == desc.dst.height();

        let color_source = read
            .attachments
            .get(&desc.color_slot)
            .map(|handle| Self::store_id(*handle));
        // Outer None: nothing to write into; inner None: the display
        let color_destination = match draw {
            Some(_) => draw_framebuffer
                .and_then(|framebuffer| framebuffer.attachments.get(&desc.color_slot))
                .map(|handle| Some(Self::store_id(*handle))),
            None => Some(None),
        };
        let depth_source = Self::depth_attachment(read);
        let depth_destination = draw_framebuffer.and_then(Self::depth_attachment);

        if desc.buffers.contains(BufferFlags::COLOR) {
            match (color_source, color_destination) {
                (Some(source), Some(destination)) => self.encode_color_blit(
                    encoder,
                    surface_view,
                    source,
                    destination,
                    desc,
                    same_size,
                ),
                _ => log::debug!("Blit skipped, {} missing on one side", desc.color_slot),
            }
        }

        if desc.buffers.intersects(BufferFlags::DEPTH | BufferFlags::STENCIL) {
            if let (Some(source), Some(destination)) = (depth_source, depth_destination) {
                self.encode_depth_blit(encoder, source, destination, desc, same_size);
            }
        }
    }

    fn encode_color_blit(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        surface_view: &wgpu::TextureView,
        source: u64,
        destination: Option<u64>,
        desc: &BlitDescriptor,
        same_size: bool,
    ) {
        let Some(src) = self.stores.get(&source) else {
            return;
        };
        let dst = destination.and_then(|id| self.stores.get(&id));
        let dst_format = dst.map_or(self.surface_config.format, |store| store.format);

        if src.desc.samples > 1 {
            match dst {
                Some(dst)
                    if dst.desc.samples == 1
                        && same_size
                        && dst.format == src.format
                        && dst.size() == src.size() =>
                {
                    let _resolve = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("Resolve"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &src.view,
                            resolve_target: Some(&dst.view),
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Load,
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        timestamp_writes: None,
                        occlusion_query_set: None,
                    });
                }
                _ => log::warn!("Multisampled blit must resolve into an equal single-sample image"),
            }
            return;
        }

        if let Some(dst) = dst {
            if same_size && dst.format == src.format && dst.desc.samples == 1 {
                encoder.copy_texture_to_texture(
                    wgpu::ImageCopyTexture {
                        texture: &src.texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d {
                            x: desc.src.x0.max(0) as u32,
                            y: desc.src.y0.max(0) as u32,
                            z: 0,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::ImageCopyTexture {
                        texture: &dst.texture,
                        mip_level: 0,
                        origin: wgpu::Origin3d {
                            x: desc.dst.x0.max(0) as u32,
                            y: desc.dst.y0.max(0) as u32,
                            z: 0,
                        },
                        aspect: wgpu::TextureAspect::All,
                    },
                    wgpu::Extent3d {
                        width: desc.src.width().unsigned_abs(),
                        height: desc.src.height().unsigned_abs(),
                        depth_or_array_layers: 1,
                    },
                );
                return;
            }
            if dst.desc.samples > 1 {
                log::warn!("Blit into a multisampled image is not supported");
                return;
            }
        }

        if !src.sampled {
            log::warn!("Scaled blit needs a shader-readable source");
            return;
        }
        let linear = desc.filter == FilterMode::Linear;
        let prepared: PreparedBlit = self.blit.prepare(
            &self.device,
            &src.view,
            src.size(),
            desc.src,
            linear,
            dst_format,
        );

        let dst_view = match destination.and_then(|id| self.stores.get(&id)) {
            Some(store) => &store.view,
            None => surface_view,
        };
        let Some(pipeline) = self.blit.pipeline(prepared.format) else {
            return;
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Blit"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: dst_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_viewport(
            desc.dst.x0 as f32,
            desc.dst.y0 as f32,
            desc.dst.width().max(1) as f32,
            desc.dst.height().max(1) as f32,
            0.0,
            1.0,
        );
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &prepared.bind_group, &[]);
        pass.draw(0..3, 0..1);
    }

    fn encode_depth_blit(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        source: u64,
        destination: u64,
        desc: &BlitDescriptor,
        same_size: bool,
    ) {
        let (Some(src), Some(dst)) = (self.stores.get(&source), self.stores.get(&destination))
        else {
            return;
        };
        let whole = desc.src == IRect::from_size(src.desc.width, src.desc.height)
            && src.size() == dst.size();
        if src.desc.samples > 1 {
            self.encode_depth_resolve(encoder, source, destination, same_size && whole);
            return;
        }
        if dst.desc.samples > 1 {
            log::warn!("Depth blit into a multisampled image is not supported");
            return;
        }
        let copyable = matches!(
            src.format,
            wgpu::TextureFormat::Depth32Float
                | wgpu::TextureFormat::Depth16Unorm
                | wgpu::TextureFormat::Stencil8
        );
        if !(same_size && whole && copyable && src.format == dst.format) {
            log::warn!("Depth blit between {:?} and {:?} is not supported", src.format, dst.format);
            return;
        }
        encoder.copy_texture_to_texture(
            src.texture.as_image_copy(),
            dst.texture.as_image_copy(),
            src.texture.size(),
        );
    }

    /// Write sample 0 of a multisampled depth store into a single-sample one
    ///
    /// Stencil is not carried over; only the depth aspect is resolved.
    fn encode_depth_resolve(
        &mut self,
        encoder: &mut wgpu::CommandEncoder,
        source: u64,
        destination: u64,
        whole: bool,
    ) {
        let (Some(src), Some(dst)) = (self.stores.get(&source), self.stores.get(&destination))
        else {
            return;
        };
        if !whole || dst.desc.samples > 1 || !dst.format.has_depth_aspect() {
            log::warn!(
                "Depth resolve needs an equally sized single-sample depth target, got {:?} x{}",
                dst.format,
                dst.desc.samples
            );
            return;
        }
        if !src.format.has_depth_aspect() {
            log::warn!("Stencil-only resolve is not supported");
            return;
        }
        let bind_group = self
            .depth_resolve
            .prepare(&self.device, src.sample_view(), dst.format);
        let Some(pipeline) = self.depth_resolve.pipeline(dst.format) else {
            return;
        };
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("Depth Resolve"),
            color_attachments: &[],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &dst.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: dst.format.has_stencil_aspect().then_some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[]);
        pass.draw(0..3, 0..1);
    }

    /// Get the device
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Get the queue
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Format of the window surface
    pub fn wgpu_surface_format(&self) -> wgpu::TextureFormat {
        self.surface_config.format
    }

    /// Get device, queue, and encoder together for operations that need all three.
    /// Recorded stage commands are encoded first so overlays draw on top of them.
    pub fn device_queue_encoder(
        &mut self,
    ) -> (&wgpu::Device, &wgpu::Queue, Option<&mut wgpu::CommandEncoder>) {
        self.flush_commands();
        (&self.device, &self.queue, self.encoder.as_mut())
    }

    /// Render egui on top of the current frame
    pub fn render_egui(
        &mut self,
        renderer: &egui_wgpu::Renderer,
        paint_jobs: &[egui::ClippedPrimitive],
        screen_descriptor: &egui_wgpu::ScreenDescriptor,
    ) {
        self.flush_commands();
        let Some(encoder) = self.encoder.as_mut() else {
            return;
        };
        let Some(view) = self.current_texture.as_ref().map(|texture| {
            texture
                .texture
                .create_view(&wgpu::TextureViewDescriptor::default())
        }) else {
            return;
        };

        let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("egui Pass"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        renderer.render(&mut render_pass, paint_jobs, screen_descriptor);
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn max_samples(&self) -> u32 {
        4
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn resize_surface(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        let max_size = self.device.limits().max_texture_dimension_2d;
        let (width, height) = Self::clamp_to_limits(max_size, width, height);
        self.surface_config.width = width;
        self.surface_config.height = height;
        self.surface.configure(&self.device, &self.surface_config);
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        let output = self.surface.get_current_texture().map_err(|e| match e {
            wgpu::SurfaceError::Lost | wgpu::SurfaceError::Outdated => BackendError::SurfaceLost,
            wgpu::SurfaceError::OutOfMemory => BackendError::OutOfMemory,
            _ => BackendError::AcquireImageFailed(e.to_string()),
        })?;

        self.current_texture = Some(output);
        self.encoder = Some(
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("Frame Encoder"),
                }),
        );
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.flush_commands();
        self.uniform_arena.clear();

        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        if let Some(texture) = self.current_texture.take() {
            texture.present();
        }
        Ok(())
    }

    fn create_framebuffer(&mut self, label: Option<&str>) -> BackendResult<FramebufferHandle> {
        let id = self.next_handle();
        log::trace!("WgpuBackend: creating framebuffer {} {:?}", id, label);
        self.framebuffers.insert(
            id,
            GpuFramebuffer {
                label: label.map(str::to_string),
                ..Default::default()
            },
        );
        Ok(FramebufferHandle(id))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(&framebuffer.0);
        if self.draw_target == Some(framebuffer) {
            self.draw_target = None;
        }
        if self.read_target == Some(framebuffer) {
            self.read_target = None;
        }
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        self.create_store(desc, true).map(ImageHandle)
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        self.stores.remove(&image.0);
        self.snapshots.remove(&image.0);
        self.bound_images.retain(|_, bound| *bound != image);
    }

    fn write_image(&mut self, image: ImageHandle, data: &[u8]) {
        let Some(store) = self.stores.get(&image.0) else {
            log::warn!("WgpuBackend: write to unknown image {:?}", image);
            return;
        };
        let (width, height) = store.size();
        let texels = (width as usize) * (height as usize);
        // Three-channel formats are stored with an opaque alpha channel
        let expanded;
        let bytes = match store.desc.format {
            TextureFormat::Rgb8 if data.len() == texels * 3 => {
                expanded = data
                    .chunks_exact(3)
                    .flat_map(|rgb| [rgb[0], rgb[1], rgb[2], 255])
                    .collect::<Vec<u8>>();
                expanded.as_slice()
            }
            _ => data,
        };
        let Some(block_size) = store.format.block_copy_size(None) else {
            log::warn!("WgpuBackend: uploads to {:?} are not supported", store.format);
            return;
        };
        if bytes.len() != texels * block_size as usize {
            log::warn!(
                "WgpuBackend: image {:?} expects {} bytes, got {}",
                image,
                texels * block_size as usize,
                bytes.len()
            );
            return;
        }
        self.queue.write_texture(
            store.texture.as_image_copy(),
            bytes,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * block_size),
                rows_per_image: None,
            },
            store.texture.size(),
        );
    }

    fn create_renderbuffer(
        &mut self,
        desc: &ImageDescriptor,
    ) -> BackendResult<RenderbufferHandle> {
        self.create_store(desc, false).map(RenderbufferHandle)
    }

    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferHandle) {
        self.stores.remove(&renderbuffer.0);
    }

    fn attach(
        &mut self,
        framebuffer: FramebufferHandle,
        slot: AttachmentSlot,
        attachment: Option<AttachmentHandle>,
    ) {
        let Some(stored) = self.framebuffers.get_mut(&framebuffer.0) else {
            log::warn!("WgpuBackend: attach to unknown framebuffer {:?}", framebuffer);
            return;
        };
        match attachment {
            Some(handle) => stored.attachments.insert(slot, handle),
            None => stored.attachments.remove(&slot),
        };
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
        self.completeness(framebuffer)
    }

    fn set_framebuffer_label(&mut self, framebuffer: FramebufferHandle, label: &str) {
        if let Some(stored) = self.framebuffers.get_mut(&framebuffer.0) {
            stored.label = Some(label.to_string());
        }
    }

    fn set_attachment_label(&mut self, attachment: AttachmentHandle, label: &str) {
        // wgpu labels are fixed at creation; keep the name for diagnostics
        if let Some(store) = self.stores.get_mut(&Self::store_id(attachment)) {
            store.desc.label = Some(label.to_string());
        }
    }

    fn bind_framebuffer(&mut self, mode: BindMode, framebuffer: Option<FramebufferHandle>) {
        if mode.includes_read() {
            self.read_target = framebuffer;
        }
        if mode.includes_draw() {
            self.draw_target = framebuffer;
        }
    }

    fn blit(&mut self, desc: &BlitDescriptor) {
        if desc.src.is_empty() || desc.dst.is_empty() || desc.buffers.is_empty() {
            log::warn!("Ignoring blit with an empty region {:?} -> {:?}", desc.src, desc.dst);
            return;
        }
        self.segments.push(Segment::Blit {
            read: self.read_target,
            draw: self.draw_target,
            desc: *desc,
        });
    }

    fn set_viewport(&mut self, rect: IRect) {
        self.viewport = rect;
    }

    fn set_clear_color(&mut self, color: Vec4) {
        self.clear_color = color;
    }

    fn clear(&mut self, buffers: BufferFlags) {
        let target = self.draw_target;
        let color = self.clear_color;
        let pass = self.open_pass(target);
        if !pass.draws.is_empty() {
            // Clears after draws start a fresh pass
            self.segments.push(Segment::Pass(PassRecord {
                target,
                clear_color: None,
                clear_depth: false,
                clear_stencil: false,
                draws: Vec::new(),
            }));
        }
        let pass = self.open_pass(target);
        if buffers.contains(BufferFlags::COLOR) {
            pass.clear_color = Some(color);
        }
        pass.clear_depth |= buffers.contains(BufferFlags::DEPTH);
        pass.clear_stencil |= buffers.contains(BufferFlags::STENCIL);
    }

    fn set_depth_test(&mut self, enabled: bool) {
        self.depth_test = enabled;
    }

    fn set_cull_mode(&mut self, mode: CullMode) {
        self.cull_mode = mode;
    }

    fn set_blend_state(&mut self, state: Option<BlendState>) {
        self.blend = state;
    }

    fn create_shader(&mut self, desc: &ShaderDescriptor<'_>) -> BackendResult<ShaderHandle> {
        let reflection = ShaderReflection::parse(desc.label, desc.source)?;

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self
            .device
            .create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(desc.label),
                source: wgpu::ShaderSource::Wgsl(desc.source.into()),
            });
        if let Some(err) = pollster::block_on(self.device.pop_error_scope()) {
            return Err(BackendError::ShaderCreationFailed {
                label: desc.label.to_string(),
                message: err.to_string(),
            });
        }

        let visibility = wgpu::ShaderStages::VERTEX_FRAGMENT;
        let uniform_entries: Vec<wgpu::BindGroupLayoutEntry> =
            NonZeroU64::new(reflection.uniform_size as u64)
                .map(|size| wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: true,
                        min_binding_size: Some(size),
                    },
                    count: None,
                })
                .into_iter()
                .collect();
        let uniform_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{} Uniforms", desc.label)),
                entries: &uniform_entries,
            });

        let mut texture_entries = Vec::new();
        for (slot, kind) in &reflection.slots {
            let (sample_type, sampler) = match kind {
                SlotKind::Color => (
                    wgpu::TextureSampleType::Float { filterable: true },
                    wgpu::SamplerBindingType::Filtering,
                ),
                SlotKind::Depth => (
                    wgpu::TextureSampleType::Depth,
                    wgpu::SamplerBindingType::NonFiltering,
                ),
            };
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot * 2,
                visibility,
                ty: wgpu::BindingType::Texture {
                    sample_type,
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot * 2 + 1,
                visibility,
                ty: wgpu::BindingType::Sampler(sampler),
                count: None,
            });
        }
        let texture_layout = self
            .device
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("{} Textures", desc.label)),
                entries: &texture_entries,
            });

        let pipeline_layout = self
            .device
            .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some(desc.label),
                bind_group_layouts: &[&uniform_layout, &texture_layout],
                push_constant_ranges: &[],
            });

        let id = self.next_handle();
        log::debug!(
            "WgpuBackend: shader '{}' has {} uniforms and {} texture slots",
            desc.label,
            reflection.members.len(),
            reflection.slots.len()
        );
        self.shaders.insert(
            id,
            GpuShader {
                label: desc.label.to_string(),
                module,
                uniforms: vec![0; reflection.uniform_size as usize],
                reflection,
                uniform_layout,
                texture_layout,
                pipeline_layout,
            },
        );
        Ok(ShaderHandle(id))
    }

    fn destroy_shader(&mut self, shader: ShaderHandle) {
        self.shaders.remove(&shader.0);
        self.pipelines.retain(|key, _| key.shader != shader.0);
        if self.current_shader == Some(shader) {
            self.current_shader = None;
        }
    }

    fn use_shader(&mut self, shader: Option<ShaderHandle>) {
        self.current_shader = shader;
    }

    fn set_uniform(&mut self, shader: ShaderHandle, name: &str, value: UniformValue) {
        let Some(stored) = self.shaders.get_mut(&shader.0) else {
            log::warn!("WgpuBackend: uniform '{}' set on unknown shader {:?}", name, shader);
            return;
        };
        let Some(member) = stored.reflection.member(name) else {
            log::trace!("Shader '{}' has no uniform '{}'", stored.label, name);
            return;
        };
        let bytes = value.to_std140_bytes();
        if bytes.len() != member.size as usize {
            log::warn!(
                "Uniform '{}' of '{}' is {} bytes, got {:?}",
                name,
                stored.label,
                member.size,
                value
            );
        }
        let start = member.offset as usize;
        let len = bytes.len().min(member.size as usize);
        stored.uniforms[start..start + len].copy_from_slice(&bytes[..len]);
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
    }

    fn create_mesh(&mut self, desc: &MeshDescriptor<'_>) -> BackendResult<MeshHandle> {
        if desc.vertices.is_empty() || desc.indices.is_empty() {
            return Err(BackendError::BufferCreationFailed(format!(
                "mesh '{}' has no geometry",
                desc.label
            )));
        }
        let vertex_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(desc.label),
                contents: desc.vertices,
                usage: wgpu::BufferUsages::VERTEX,
            });
        let index_buffer = self
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(desc.label),
                contents: bytemuck::cast_slice(desc.indices),
                usage: wgpu::BufferUsages::INDEX,
            });
        let id = self.next_handle();
        self.meshes.insert(
            id,
            GpuMesh {
                vertex_buffer,
                index_buffer,
                index_count: desc.indices.len() as u32,
                layout: desc.layout.clone(),
            },
        );
        Ok(MeshHandle(id))
    }

    fn destroy_mesh(&mut self, mesh: MeshHandle) {
        self.meshes.remove(&mesh.0);
    }

    fn draw_mesh(&mut self, mesh: MeshHandle) {
        let Some(shader_handle) = self.current_shader else {
            log::warn!("WgpuBackend: draw without a shader");
            return;
        };
        let Some(shader) = self.shaders.get(&shader_handle.0) else {
            return;
        };
        if !self.meshes.contains_key(&mesh.0) {
            log::warn!("WgpuBackend: draw of unknown mesh {:?}", mesh);
            return;
        }

        let offset = self.uniform_arena.len().next_multiple_of(self.uniform_alignment);
        if !shader.uniforms.is_empty() {
            self.uniform_arena.resize(offset, 0);
            self.uniform_arena.extend_from_slice(&shader.uniforms);
        }

        let attached = self.draw_target_images();
        let images: BTreeMap<u32, (ImageHandle, bool)> = shader
            .reflection
            .slots
            .keys()
            .filter_map(|slot| {
                let image = *self.bound_images.get(slot)?;
                Some((*slot, (image, attached.contains(&image.0))))
            })
            .collect();

        let draw = RecordedDraw {
            shader: shader_handle.0,
            mesh: mesh.0,
            viewport: self.viewport,
            uniform_offset: offset as u32,
            images,
            blend: self.blend,
            depth_test: self.depth_test,
            cull_mode: self.cull_mode,
        };

        let feedback: Vec<ImageHandle> = draw
            .images
            .values()
            .filter(|(_, snapshot)| *snapshot)
            .map(|(image, _)| *image)
            .collect();
        for image in feedback {
            self.segments.push(Segment::Snapshot(image));
        }

        let target = self.draw_target;
        self.open_pass(target).draws.push(draw);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
