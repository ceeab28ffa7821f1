//! Camera component and projections

use crate::backend::{AttachmentSlot, BackendResult, GraphicsBackend, TextureFormat};
use crate::render_target::{RenderBufferDesc, RenderTarget, SharedRenderTarget};
use bevy_ecs::prelude::*;
use glam::{Mat4, Vec4};

/// Camera projection type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    Perspective {
        fov_y: f32,
        aspect: f32,
        near: f32,
        far: f32,
    },
    Orthographic {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
        near: f32,
        far: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::perspective(60.0, 1.0, 0.1, 1000.0)
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
            near,
            far,
        }
    }

    pub fn orthographic(width: f32, height: f32, near: f32, far: f32) -> Self {
        let half_w = width / 2.0;
        let half_h = height / 2.0;
        Projection::Orthographic {
            left: -half_w,
            right: half_w,
            bottom: -half_h,
            top: half_h,
            near,
            far,
        }
    }

    pub fn matrix(&self) -> Mat4 {
        match *self {
            Projection::Perspective {
                fov_y,
                aspect,
                near,
                far,
            } => Mat4::perspective_rh(fov_y, aspect, near, far),
            Projection::Orthographic {
                left,
                right,
                bottom,
                top,
                near,
                far,
            } => Mat4::orthographic_rh(left, right, bottom, top, near, far),
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        if let Projection::Perspective { aspect: a, .. } = self {
            *a = aspect;
        }
    }
}

/// A camera rendering the scene into its own target
///
/// The view matrix is the inverse of the entity's transform.
#[derive(Component, Clone)]
pub struct Camera {
    /// The main camera's output is what the lighting and post stages consume
    pub is_main: bool,
    /// Target the next frame is drawn into
    pub back_buffer: SharedRenderTarget,
    /// Last presented image of a double-buffered camera
    pub front_buffer: Option<SharedRenderTarget>,
    pub clear_color: Vec4,
    pub projection: Mat4,
}

impl Camera {
    pub fn new(back_buffer: SharedRenderTarget, projection: Mat4) -> Self {
        Self {
            is_main: false,
            back_buffer,
            front_buffer: None,
            clear_color: Vec4::new(0.0, 0.0, 0.0, 1.0),
            projection,
        }
    }

    pub fn main(back_buffer: SharedRenderTarget, projection: Mat4) -> Self {
        Self {
            is_main: true,
            ..Self::new(back_buffer, projection)
        }
    }

    pub fn with_clear_color(mut self, color: Vec4) -> Self {
        self.clear_color = color;
        self
    }

    /// Give the camera a front buffer cloned from the back buffer's layout
    pub fn double_buffered(mut self, backend: &mut dyn GraphicsBackend) -> BackendResult<Self> {
        let mut front = self.back_buffer.read().clone_target(backend)?;
        if let Some(name) = self.back_buffer.read().debug_name() {
            front.set_debug_name(backend, &format!("{}_Front", name));
        }
        self.front_buffer = Some(front.shared());
        Ok(self)
    }

    pub fn is_double_buffered(&self) -> bool {
        self.front_buffer.is_some()
    }

    /// Exchange front and back buffers
    pub fn swap_buffers(&mut self) {
        if let Some(front) = self.front_buffer.as_mut() {
            std::mem::swap(front, &mut self.back_buffer);
        }
    }

    /// Every target this camera owns
    pub fn buffers(&self) -> impl Iterator<Item = &SharedRenderTarget> {
        std::iter::once(&self.back_buffer).chain(self.front_buffer.iter())
    }
}

/// Main camera G-buffer: albedo, normals and depth, all sampleable
pub fn create_gbuffer_target(
    backend: &mut dyn GraphicsBackend,
    width: u32,
    height: u32,
    samples: u32,
) -> BackendResult<RenderTarget> {
    let mut target = RenderTarget::new(backend, width, height, samples)?;
    target.add_attachment(
        backend,
        RenderBufferDesc::new(AttachmentSlot::Color0, TextureFormat::Rgb8, true),
    )?;
    target.add_attachment(
        backend,
        RenderBufferDesc::new(AttachmentSlot::Color1, TextureFormat::Rgb10, true),
    )?;
    target.add_attachment(
        backend,
        RenderBufferDesc::new(AttachmentSlot::Depth, TextureFormat::Depth32, true),
    )?;
    target.validate(backend);
    target.set_debug_name(backend, "MainBuffer");
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use std::sync::Arc;

    #[test]
    fn test_projection_matrices() {
        let mut projection = Projection::perspective(60.0, 1.0, 0.1, 100.0);
        assert_eq!(
            projection.matrix(),
            Mat4::perspective_rh(60f32.to_radians(), 1.0, 0.1, 100.0)
        );
        projection.set_aspect(2.0);
        assert_eq!(
            projection.matrix(),
            Mat4::perspective_rh(60f32.to_radians(), 2.0, 0.1, 100.0)
        );

        let mut ortho = Projection::orthographic(4.0, 2.0, 0.1, 10.0);
        ortho.set_aspect(3.0);
        assert_eq!(
            ortho.matrix(),
            Mat4::orthographic_rh(-2.0, 2.0, -1.0, 1.0, 0.1, 10.0)
        );
    }

    #[test]
    fn test_gbuffer_layout() {
        let mut backend = HeadlessBackend::default();
        let mut target = create_gbuffer_target(&mut backend, 64, 32, 4).unwrap();
        assert!(target.is_valid());
        assert_eq!(
            target.draw_slots(),
            &[AttachmentSlot::Color0, AttachmentSlot::Color1]
        );
        assert!(target.get_attachment(AttachmentSlot::Depth).is_some());
        target.destroy(&mut backend);
    }

    #[test]
    fn test_swap_exchanges_buffers() {
        let mut backend = HeadlessBackend::default();
        let back = create_gbuffer_target(&mut backend, 16, 16, 1).unwrap().shared();
        let mut camera = Camera::main(back.clone(), Mat4::IDENTITY)
            .double_buffered(&mut backend)
            .unwrap();
        let front = camera.front_buffer.clone().unwrap();

        camera.swap_buffers();
        assert!(Arc::ptr_eq(&camera.back_buffer, &front));
        assert!(Arc::ptr_eq(camera.front_buffer.as_ref().unwrap(), &back));
        assert_eq!(camera.buffers().count(), 2);

        for buffer in camera.buffers() {
            buffer.write().destroy(&mut backend);
        }
    }
}
