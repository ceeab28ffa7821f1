//! Deferred Frame Pipeline - render targets, shadowed deferred lighting and post-processing
//!
//! A frame runs three layers over a [`GraphicsBackend`](backend::GraphicsBackend):
//! - **Scene**: shadow depth passes, then every camera draws its G-buffer
//! - **Lighting**: per-light accumulation with shadow maps, masks and projectors
//! - **Post**: a configurable chain of full-screen passes ending on the display
//!
//! Two backends implement the device trait:
//! - **wgpu**: windowed rendering (feature `wgpu-backend`, on by default)
//! - **headless**: records commands and resource state, used by the tests
//!
//! The scene lives in a Bevy ECS [`World`]; layers see a per-frame snapshot of it.

pub mod backend;
pub mod config;
pub mod engine;
pub mod frame_state;
pub mod pipeline;
pub mod render_target;
pub mod resources;
pub mod scene;
pub mod shaders;
pub mod window;

#[cfg(feature = "wgpu-backend")]
pub mod egui_integration;

// Re-export Bevy ECS prelude for users
pub use bevy_ecs::prelude::*;

pub use config::{init_logging, BackendType, EngineConfig, LightingConfig, PostConfig};
pub use engine::Renderer;
pub use render_target::{RenderBufferDesc, RenderTarget, SharedRenderTarget};
pub use window::{KeyInput, Window};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;
#[cfg(feature = "wgpu-backend")]
pub use egui_integration::EguiOverlay;
