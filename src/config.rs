//! Renderer configuration

use crate::frame_state::DepthRange;
use glam::Vec3;

/// Backend selection for the renderer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// CPU command recorder, no window or GPU required
    Headless,
    /// wgpu device drawing to a window surface
    #[default]
    Wgpu,
}

/// Light accumulation settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightingConfig {
    /// Color the accumulation buffer is cleared to each frame
    pub ambient: Vec3,
    pub exposure: f32,
}

impl Default for LightingConfig {
    fn default() -> Self {
        Self {
            ambient: Vec3::splat(0.01),
            exposure: 1.0,
        }
    }
}

/// Which built-in post-processing effects to create
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostConfig {
    pub bloom: bool,
    pub motion_blur: bool,
    pub depth_of_field: bool,
    /// Horizontal and vertical blur pairs in the bloom chain
    pub blur_iterations: u32,
}

impl Default for PostConfig {
    fn default() -> Self {
        Self {
            bloom: true,
            motion_blur: true,
            depth_of_field: true,
            blur_iterations: 10,
        }
    }
}

/// Configuration for initializing the renderer
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Which backend to use
    pub backend: BackendType,
    /// Enable vsync
    pub vsync: bool,
    /// MSAA sample count of the main camera buffer
    pub samples: u32,
    /// Depth convention of camera projections
    pub depth_range: DepthRange,
    pub lighting: LightingConfig,
    pub post: PostConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            title: "Deferred Frame Pipeline".to_string(),
            width: 1280,
            height: 720,
            backend: BackendType::Wgpu,
            vsync: true,
            samples: 1,
            depth_range: DepthRange::ZeroToOne,
            lighting: LightingConfig::default(),
            post: PostConfig::default(),
        }
    }
}

/// Install `env_logger`, honoring `RUST_LOG` and defaulting to `info`
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.samples, 1);
        assert_eq!(config.lighting.ambient, Vec3::splat(0.01));
        assert_eq!(config.post.blur_iterations, 10);
        assert!(config.post.bloom && config.post.motion_blur && config.post.depth_of_field);
    }
}
