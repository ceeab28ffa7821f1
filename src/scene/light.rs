//! Light components

use crate::backend::{AttachmentSlot, BackendResult, GraphicsBackend, ImageHandle, TextureFormat};
use crate::render_target::{RenderBufferDesc, RenderTarget, SharedRenderTarget};
use crate::scene::Transform;
use bevy_ecs::prelude::*;
use glam::{Mat4, UVec2, Vec3};

/// A light that renders scene depth from its point of view and casts shadows
///
/// Position and orientation come from the Transform on the same entity.
#[derive(Component, Clone)]
pub struct ShadowLight {
    /// Private depth-only target
    pub shadow_buffer: SharedRenderTarget,
    /// Masks off parts of the light's view from shadow evaluation
    pub mask: Option<ImageHandle>,
    /// Picture projected onto lit surfaces
    pub projector_image: Option<ImageHandle>,
    pub projector_intensity: f32,
    pub projection: Mat4,
    pub color: Vec3,
    pub attenuation: f32,
}

impl ShadowLight {
    pub fn with_mask(mut self, mask: ImageHandle) -> Self {
        self.mask = Some(mask);
        self
    }

    pub fn with_projector(mut self, image: ImageHandle, intensity: f32) -> Self {
        self.projector_image = Some(image);
        self.projector_intensity = intensity;
        self
    }

    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color;
        self
    }
}

/// Unshadowed point light
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct PointLight {
    pub color: Vec3,
    pub attenuation: f32,
}

impl Default for PointLight {
    fn default() -> Self {
        Self {
            color: Vec3::ONE,
            attenuation: 0.1,
        }
    }
}

impl PointLight {
    pub fn new(color: Vec3, attenuation: f32) -> Self {
        Self { color, attenuation }
    }
}

/// Parameters for [`create_shadow_caster`]
#[derive(Debug, Clone)]
pub struct ShadowCasterDesc {
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    /// Far plane of the light's projection
    pub distance: f32,
    pub fov_degrees: f32,
    pub buffer_size: UVec2,
    pub name: Option<String>,
}

impl Default for ShadowCasterDesc {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 5.0, 5.0),
            target: Vec3::ZERO,
            up: Vec3::Y,
            distance: 10.0,
            fov_degrees: 60.0,
            buffer_size: UVec2::new(1024, 1024),
            name: None,
        }
    }
}

impl ShadowCasterDesc {
    pub fn new(position: Vec3, target: Vec3) -> Self {
        Self {
            position,
            target,
            ..Default::default()
        }
    }
}

/// Spawn an entity with a shadow light and a transform looking at `desc.target`
pub fn create_shadow_caster(
    world: &mut World,
    backend: &mut dyn GraphicsBackend,
    desc: ShadowCasterDesc,
) -> BackendResult<Entity> {
    let mut shadow_buffer = RenderTarget::new(backend, desc.buffer_size.x, desc.buffer_size.y, 1)?;
    shadow_buffer.add_attachment(
        backend,
        RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth32, true),
    )?;
    shadow_buffer.validate(backend);
    if let Some(name) = desc.name.as_deref() {
        shadow_buffer.set_debug_name(backend, name);
    }

    let aspect = desc.buffer_size.x as f32 / desc.buffer_size.y as f32;
    let light = ShadowLight {
        shadow_buffer: shadow_buffer.shared(),
        mask: None,
        projector_image: None,
        projector_intensity: 0.25,
        projection: Mat4::perspective_rh(desc.fov_degrees.to_radians(), aspect, 0.25, desc.distance),
        color: Vec3::ONE,
        attenuation: 1.0 / desc.distance,
    };
    let transform = Transform::looking_at(desc.position, desc.target, desc.up);

    let entity = world.spawn((light, transform)).id();
    log::info!(
        "Created shadow caster {:?} at {} ({}x{})",
        entity,
        desc.position,
        desc.buffer_size.x,
        desc.buffer_size.y
    );
    Ok(entity)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn test_shadow_caster_defaults() {
        let mut world = World::new();
        let mut backend = HeadlessBackend::default();
        let entity = create_shadow_caster(
            &mut world,
            &mut backend,
            ShadowCasterDesc {
                buffer_size: UVec2::new(128, 64),
                name: Some("Sun".into()),
                ..Default::default()
            },
        )
        .unwrap();

        let light = world.get::<ShadowLight>(entity).unwrap();
        assert!((light.attenuation - 0.1).abs() < 1e-6);
        assert_eq!(light.projector_intensity, 0.25);
        assert_eq!(light.color, Vec3::ONE);
        let buffer = light.shadow_buffer.read();
        assert!(buffer.is_valid());
        assert_eq!(buffer.size(), (128, 64));
        assert!(buffer.get_attachment(AttachmentSlot::Depth).is_some());
        assert_eq!(buffer.debug_name(), Some("Sun"));
        assert!(world.get::<Transform>(entity).is_some());
    }
}
