//! Renderable component

use crate::resources::{Material, Mesh};
use bevy_ecs::prelude::*;
use std::sync::Arc;

/// Mesh and material drawn by every camera
///
/// Entities missing either reference stay in the scene but are never drawn.
#[derive(Component, Clone, Default)]
pub struct Renderable {
    pub mesh: Option<Arc<Mesh>>,
    pub material: Option<Arc<Material>>,
    /// Drawn into shadow-light depth targets
    pub casts_shadows: bool,
}

impl Renderable {
    pub fn new(mesh: Arc<Mesh>, material: Arc<Material>) -> Self {
        Self {
            mesh: Some(mesh),
            material: Some(material),
            casts_shadows: true,
        }
    }

    pub fn without_shadows(mut self) -> Self {
        self.casts_shadows = false;
        self
    }
}
