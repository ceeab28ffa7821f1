//! Core backend abstraction traits
//!
//! Every pipeline stage receives the backend explicitly as `&mut dyn GraphicsBackend`;
//! bound framebuffers, shaders and images are state of the backend value, not of the process.

use crate::backend::completeness::CompletenessError;
use crate::backend::types::*;
use glam::Vec4;
use std::any::Any;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to compile shader {label}: {message}")]
    ShaderCreationFailed { label: String, message: String },
    #[error("Failed to load image: {0}")]
    ImageLoadFailed(String),
    #[error("Unknown {kind} handle {id}")]
    UnknownHandle { kind: &'static str, id: u64 },
    #[error("Surface lost")]
    SurfaceLost,
    #[error("Out of memory")]
    OutOfMemory,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a framebuffer object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a shader-readable image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageHandle(pub(crate) u64);

/// Handle to an opaque render-only buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RenderbufferHandle(pub(crate) u64);

/// Handle to a linked shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShaderHandle(pub(crate) u64);

/// Handle to uploaded geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshHandle(pub(crate) u64);

/// Backing store attached to a framebuffer slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentHandle {
    Image(ImageHandle),
    Renderbuffer(RenderbufferHandle),
}

/// Graphics device operations used by render targets and pipeline stages
///
/// The model is a bind-then-draw device: a framebuffer is bound for draw and/or read,
/// raster state and a shader are set, then meshes are drawn. `None` as a framebuffer
/// means the display surface.
pub trait GraphicsBackend {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Largest sample count accepted for multisampled attachments
    fn max_samples(&self) -> u32;

    /// Current size of the display surface
    fn surface_size(&self) -> (u32, u32);

    /// Reconfigure the display surface
    fn resize_surface(&mut self, width: u32, height: u32);

    /// Begin recording a frame
    fn begin_frame(&mut self) -> BackendResult<()>;

    /// Submit the recorded frame and present it
    fn end_frame(&mut self) -> BackendResult<()>;

    fn create_framebuffer(&mut self, label: Option<&str>) -> BackendResult<FramebufferHandle>;
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;
    fn destroy_image(&mut self, image: ImageHandle);

    /// Upload tightly packed texels matching the image's format
    fn write_image(&mut self, image: ImageHandle, data: &[u8]);

    fn create_renderbuffer(&mut self, desc: &ImageDescriptor)
        -> BackendResult<RenderbufferHandle>;
    fn destroy_renderbuffer(&mut self, renderbuffer: RenderbufferHandle);

    /// Attach a backing store to a slot, or detach with `None`
    fn attach(
        &mut self,
        framebuffer: FramebufferHandle,
        slot: AttachmentSlot,
        attachment: Option<AttachmentHandle>,
    );

    /// Configure the color slots written simultaneously, in output order
    fn set_draw_slots(&mut self, framebuffer: FramebufferHandle, slots: &[AttachmentSlot]);

    /// Check whether the framebuffer's attachments form a drawable target
    fn check_completeness(&mut self, framebuffer: FramebufferHandle)
        -> Result<(), CompletenessError>;

    fn set_framebuffer_label(&mut self, framebuffer: FramebufferHandle, label: &str);
    fn set_attachment_label(&mut self, attachment: AttachmentHandle, label: &str);

    /// Bind a framebuffer (or the display with `None`) for the given mode
    fn bind_framebuffer(&mut self, mode: BindMode, framebuffer: Option<FramebufferHandle>);

    /// Copy from the bound read framebuffer into the bound draw framebuffer
    fn blit(&mut self, desc: &BlitDescriptor);

    fn set_viewport(&mut self, rect: IRect);
    fn set_clear_color(&mut self, color: Vec4);
    fn clear(&mut self, buffers: BufferFlags);
    fn set_depth_test(&mut self, enabled: bool);
    fn set_cull_mode(&mut self, mode: CullMode);
    fn set_blend_state(&mut self, state: Option<BlendState>);

    fn create_shader(&mut self, desc: &ShaderDescriptor<'_>) -> BackendResult<ShaderHandle>;
    fn destroy_shader(&mut self, shader: ShaderHandle);
    fn use_shader(&mut self, shader: Option<ShaderHandle>);

    /// Store a uniform value on a program; it persists until overwritten
    fn set_uniform(&mut self, shader: ShaderHandle, name: &str, value: UniformValue);

    /// Bind an image to a sampler slot, or unbind with `None`
    fn bind_image(&mut self, slot: u32, image: Option<ImageHandle>);

    fn create_mesh(&mut self, desc: &MeshDescriptor<'_>) -> BackendResult<MeshHandle>;
    fn destroy_mesh(&mut self, mesh: MeshHandle);

    /// Draw a mesh with the current shader, raster state and bound images
    fn draw_mesh(&mut self, mesh: MeshHandle);

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
