//! Scene components and the per-frame view the stages read

mod camera;
mod light;
mod renderable;
mod transform;
mod view;

pub use camera::*;
pub use light::*;
pub use renderable::*;
pub use transform::*;
pub use view::*;
