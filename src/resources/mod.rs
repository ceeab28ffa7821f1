//! Resource management
//!
//! Shaders, materials, meshes and images shared by the pipeline stages.

mod material;
mod mesh;
mod shader;
mod texture;

pub use material::*;
pub use mesh::*;
pub use shader::*;
pub use texture::*;
