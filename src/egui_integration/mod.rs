//! egui overlay for the layer settings windows
//!
//! The overlay is drawn after the post stage has written the display and before the frame
//! is presented.

mod wgpu;

pub use self::wgpu::EguiOverlay;
