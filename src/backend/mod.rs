//! Backend abstraction layer
//!
//! Provides the device trait and the types both the headless and wgpu backends share.

pub mod completeness;
pub mod headless;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use completeness::{AttachmentInfo, CompletenessError};
pub use headless::{Command, DrawRecord, HeadlessBackend, ResourceCounters};
pub use traits::*;
pub use types::*;
