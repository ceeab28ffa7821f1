//! Common types shared between backends

use bytemuck::{Pod, Zeroable};
use glam::{IVec2, Mat3, Mat4, Vec2, Vec3, Vec4};
use std::fmt;

/// Pixel formats a render target attachment can be backed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// 8 bits per channel RGBA
    Rgba8,
    /// 10 bits per channel RGB
    Rgb10,
    Rgb8,
    Rg8,
    R8,
    /// Half-float RGB, used for HDR accumulation
    Rgb16Float,
    Rgba16Float,
    Depth24Stencil8,
    Depth16,
    Depth24,
    Depth32,
    Stencil4,
    Stencil8,
    Stencil16,
}

impl TextureFormat {
    pub fn is_color(&self) -> bool {
        !self.has_depth() && !self.has_stencil()
    }

    pub fn is_depth(&self) -> bool {
        self.has_depth()
    }

    pub fn has_depth(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth24Stencil8
                | TextureFormat::Depth16
                | TextureFormat::Depth24
                | TextureFormat::Depth32
        )
    }

    pub fn has_stencil(&self) -> bool {
        matches!(
            self,
            TextureFormat::Depth24Stencil8
                | TextureFormat::Stencil4
                | TextureFormat::Stencil8
                | TextureFormat::Stencil16
        )
    }

    /// Number of channels stored for color formats
    pub fn channels(&self) -> u32 {
        match self {
            TextureFormat::Rgba8 | TextureFormat::Rgba16Float => 4,
            TextureFormat::Rgb10 | TextureFormat::Rgb8 | TextureFormat::Rgb16Float => 3,
            TextureFormat::Rg8 => 2,
            _ => 1,
        }
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::R8 | TextureFormat::Stencil4 | TextureFormat::Stencil8 => 1,
            TextureFormat::Rg8 | TextureFormat::Depth16 | TextureFormat::Stencil16 => 2,
            TextureFormat::Rgb8 => 3,
            TextureFormat::Rgba8
            | TextureFormat::Rgb10
            | TextureFormat::Depth24Stencil8
            | TextureFormat::Depth24
            | TextureFormat::Depth32 => 4,
            TextureFormat::Rgb16Float => 6,
            TextureFormat::Rgba16Float => 8,
        }
    }
}

/// Attachment points of a render target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AttachmentSlot {
    Color0,
    Color1,
    Color2,
    Color3,
    Color4,
    Color5,
    Color6,
    Color7,
    Depth,
    DepthStencil,
    Stencil,
}

impl AttachmentSlot {
    pub const COLORS: [AttachmentSlot; 8] = [
        AttachmentSlot::Color0,
        AttachmentSlot::Color1,
        AttachmentSlot::Color2,
        AttachmentSlot::Color3,
        AttachmentSlot::Color4,
        AttachmentSlot::Color5,
        AttachmentSlot::Color6,
        AttachmentSlot::Color7,
    ];

    pub fn is_color(&self) -> bool {
        self.color_index().is_some()
    }

    /// Index of a color slot (Color3 -> 3)
    pub fn color_index(&self) -> Option<usize> {
        Self::COLORS.iter().position(|slot| slot == self)
    }

    /// Whether this slot reads the depth aspect of its attachment
    pub fn holds_depth(&self) -> bool {
        matches!(self, AttachmentSlot::Depth | AttachmentSlot::DepthStencil)
    }

    pub fn holds_stencil(&self) -> bool {
        matches!(self, AttachmentSlot::Stencil | AttachmentSlot::DepthStencil)
    }
}

impl fmt::Display for AttachmentSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a framebuffer is bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BindMode {
    #[default]
    None,
    Draw,
    Read,
    Both,
}

impl BindMode {
    pub fn includes_draw(&self) -> bool {
        matches!(self, BindMode::Draw | BindMode::Both)
    }

    pub fn includes_read(&self) -> bool {
        matches!(self, BindMode::Read | BindMode::Both)
    }
}

/// Which buffers a clear or blit touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferFlags(u32);

impl BufferFlags {
    pub const NONE: Self = Self(0);
    pub const COLOR: Self = Self(1 << 0);
    pub const DEPTH: Self = Self(1 << 1);
    pub const STENCIL: Self = Self(1 << 2);
    pub const ALL: Self = Self((1 << 0) | (1 << 1) | (1 << 2));

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn intersects(&self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for BufferFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Integer rectangle given by two corners, `x1`/`y1` exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IRect {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
}

impl IRect {
    pub fn new(x0: i32, y0: i32, x1: i32, y1: i32) -> Self {
        Self { x0, y0, x1, y1 }
    }

    /// Rectangle covering `width` x `height` from the origin
    pub fn from_size(width: u32, height: u32) -> Self {
        Self::new(0, 0, width as i32, height as i32)
    }

    pub fn width(&self) -> i32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> i32 {
        self.y1 - self.y0
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Filter mode for samplers and scaled blits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterMode {
    Nearest,
    Linear,
}

/// A copy between the bound read and draw framebuffers
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlitDescriptor {
    pub src: IRect,
    pub dst: IRect,
    pub buffers: BufferFlags,
    pub filter: FilterMode,
    /// Color slot read from the source and written on the destination
    pub color_slot: AttachmentSlot,
}

/// Descriptor shared by shader-readable images and opaque renderbuffers
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub samples: u32,
}

impl Default for ImageDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            format: TextureFormat::Rgba8,
            samples: 1,
        }
    }
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend component state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

/// Blend state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }

    /// One + one on every channel
    pub fn additive() -> Self {
        let one_one = BlendComponent {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::One,
            operation: BlendOperation::Add,
        };
        Self {
            color: one_one,
            alpha: one_one,
        }
    }
}

/// A value uploaded to a named shader uniform
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2(Vec2),
    IVec2(IVec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat3(Mat3),
    Mat4(Mat4),
}

impl UniformValue {
    /// Bytes laid out the way a uniform block member expects them
    pub fn to_std140_bytes(&self) -> Vec<u8> {
        match self {
            UniformValue::Float(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Int(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec2(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::IVec2(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec3(v) => bytemuck::bytes_of(v).to_vec(),
            UniformValue::Vec4(v) => bytemuck::bytes_of(v).to_vec(),
            // mat3 columns are padded to 16 bytes
            UniformValue::Mat3(m) => {
                let mut bytes = Vec::with_capacity(48);
                for column in [m.x_axis, m.y_axis, m.z_axis] {
                    bytes.extend_from_slice(bytemuck::bytes_of(&column.extend(0.0)));
                }
                bytes
            }
            UniformValue::Mat4(v) => bytemuck::bytes_of(v).to_vec(),
        }
    }
}

impl From<f32> for UniformValue {
    fn from(value: f32) -> Self {
        UniformValue::Float(value)
    }
}

impl From<i32> for UniformValue {
    fn from(value: i32) -> Self {
        UniformValue::Int(value)
    }
}

impl From<bool> for UniformValue {
    fn from(value: bool) -> Self {
        UniformValue::Int(value as i32)
    }
}

impl From<Vec2> for UniformValue {
    fn from(value: Vec2) -> Self {
        UniformValue::Vec2(value)
    }
}

impl From<IVec2> for UniformValue {
    fn from(value: IVec2) -> Self {
        UniformValue::IVec2(value)
    }
}

impl From<Vec3> for UniformValue {
    fn from(value: Vec3) -> Self {
        UniformValue::Vec3(value)
    }
}

impl From<Vec4> for UniformValue {
    fn from(value: Vec4) -> Self {
        UniformValue::Vec4(value)
    }
}

impl From<Mat3> for UniformValue {
    fn from(value: Mat3) -> Self {
        UniformValue::Mat3(value)
    }
}

impl From<Mat4> for UniformValue {
    fn from(value: Mat4) -> Self {
        UniformValue::Mat4(value)
    }
}

/// Source of a shader program
#[derive(Debug, Clone, Copy)]
pub struct ShaderDescriptor<'a> {
    pub label: &'a str,
    /// WGSL with a `vs_main` entry point and an optional `fs_main`
    pub source: &'a str,
}

/// Vertex attribute format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
}

impl VertexFormat {
    pub fn size(&self) -> u64 {
        match self {
            VertexFormat::Float32 => 4,
            VertexFormat::Float32x2 => 8,
            VertexFormat::Float32x3 => 12,
            VertexFormat::Float32x4 => 16,
        }
    }
}

/// Vertex attribute description
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: VertexFormat,
    pub offset: u64,
}

/// Vertex buffer layout
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VertexBufferLayout {
    pub array_stride: u64,
    pub attributes: Vec<VertexAttribute>,
}

/// Geometry handed to the backend
#[derive(Debug, Clone, Copy)]
pub struct MeshDescriptor<'a> {
    pub label: &'a str,
    pub vertices: &'a [u8],
    pub layout: &'a VertexBufferLayout,
    pub indices: &'a [u32],
}

/// Standard vertex with position, normal and UV
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
        }
    }

    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x3,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x3,
                    offset: 12,
                },
                VertexAttribute {
                    location: 2,
                    format: VertexFormat::Float32x2,
                    offset: 24,
                },
            ],
        }
    }
}

/// Full-screen quad vertex, clip-space position and UV
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable, PartialEq)]
pub struct QuadVertex {
    pub position: Vec2,
    pub uv: Vec2,
}

impl QuadVertex {
    pub fn layout() -> VertexBufferLayout {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            attributes: vec![
                VertexAttribute {
                    location: 0,
                    format: VertexFormat::Float32x2,
                    offset: 0,
                },
                VertexAttribute {
                    location: 1,
                    format: VertexFormat::Float32x2,
                    offset: 8,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_classification() {
        assert!(TextureFormat::Rgb8.is_color());
        assert!(TextureFormat::Depth32.has_depth());
        assert!(!TextureFormat::Depth32.has_stencil());
        assert!(TextureFormat::Depth24Stencil8.has_depth());
        assert!(TextureFormat::Depth24Stencil8.has_stencil());
        assert!(TextureFormat::Stencil8.has_stencil());
        assert!(!TextureFormat::Stencil8.is_color());
    }

    #[test]
    fn test_color_slot_index() {
        assert_eq!(AttachmentSlot::Color0.color_index(), Some(0));
        assert_eq!(AttachmentSlot::Color7.color_index(), Some(7));
        assert_eq!(AttachmentSlot::Depth.color_index(), None);
        assert!(!AttachmentSlot::Stencil.is_color());
    }

    #[test]
    fn test_buffer_flags() {
        let flags = BufferFlags::DEPTH | BufferFlags::STENCIL;
        assert!(flags.contains(BufferFlags::DEPTH));
        assert!(!flags.contains(BufferFlags::COLOR));
        assert!(BufferFlags::ALL.contains(flags));
        assert!(BufferFlags::NONE.is_empty());
    }

    #[test]
    fn test_mat3_uniform_is_padded() {
        let bytes = UniformValue::Mat3(Mat3::IDENTITY).to_std140_bytes();
        assert_eq!(bytes.len(), 48);
        let floats: &[f32] = bytemuck::cast_slice(&bytes);
        assert_eq!(&floats[0..4], &[1.0, 0.0, 0.0, 0.0]);
        assert_eq!(&floats[4..8], &[0.0, 1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_rect_from_size() {
        let rect = IRect::from_size(256, 128);
        assert_eq!(rect.width(), 256);
        assert_eq!(rect.height(), 128);
        assert!(!rect.is_empty());
    }
}
