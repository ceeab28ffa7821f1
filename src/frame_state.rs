//! Current and previous frame camera state
//!
//! The scene stage advances the store once per frame after it finishes the main camera;
//! lighting and post-processing read it afterwards.

use crate::render_target::SharedRenderTarget;
use glam::Mat4;
use thiserror::Error;

/// Clip-space depth convention of a projection matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DepthRange {
    /// Depth mapped to `0..1` (`Mat4::perspective_rh`, wgpu)
    #[default]
    ZeroToOne,
    /// Depth mapped to `-1..1` (`Mat4::perspective_rh_gl`)
    NegativeOneToOne,
}

/// Why near and far planes could not be recovered from a projection
#[derive(Error, Debug, Clone, Copy, PartialEq)]
pub enum ProjectionError {
    #[error("projection is not a standard perspective matrix")]
    NotPerspective,
    #[error("derived planes are degenerate (near {near}, far {far})")]
    DegeneratePlanes { near: f32, far: f32 },
}

/// Near and far clip distances
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClipPlanes {
    pub near: f32,
    pub far: f32,
}

impl ClipPlanes {
    /// Recover the clip planes from a right-handed perspective projection
    ///
    /// Orthographic or otherwise-shaped matrices are rejected instead of producing
    /// meaningless planes.
    pub fn from_projection(projection: &Mat4, range: DepthRange) -> Result<Self, ProjectionError> {
        const EPSILON: f32 = 1e-5;
        if (projection.z_axis.w + 1.0).abs() > EPSILON || projection.w_axis.w.abs() > EPSILON {
            return Err(ProjectionError::NotPerspective);
        }

        let m22 = projection.z_axis.z;
        let m32 = projection.w_axis.z;
        let (near, far) = match range {
            DepthRange::ZeroToOne => {
                let near = m32 / m22;
                (near, m32 / (m22 + 1.0))
            }
            DepthRange::NegativeOneToOne => {
                let near = (2.0 * m32) / (2.0 * m22 - 2.0);
                (near, ((m22 - 1.0) * near) / (m22 + 1.0))
            }
        };

        if !near.is_finite() || !far.is_finite() || near <= 0.0 || far <= near {
            return Err(ProjectionError::DegeneratePlanes { near, far });
        }
        Ok(Self { near, far })
    }
}

/// Camera state of one frame
#[derive(Clone)]
pub struct FrameSnapshot {
    /// Target the main camera rendered into
    pub output: Option<SharedRenderTarget>,
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
}

impl FrameSnapshot {
    pub fn new(output: Option<SharedRenderTarget>, view: Mat4, projection: Mat4) -> Self {
        Self {
            output,
            view,
            projection,
            view_projection: projection * view,
        }
    }

    pub fn view_inverse(&self) -> Mat4 {
        self.view.inverse()
    }

    pub fn projection_inverse(&self) -> Mat4 {
        self.projection.inverse()
    }

    pub fn view_projection_inverse(&self) -> Mat4 {
        self.view_projection.inverse()
    }

    pub fn clip_planes(&self, range: DepthRange) -> Result<ClipPlanes, ProjectionError> {
        ClipPlanes::from_projection(&self.projection, range)
    }
}

impl Default for FrameSnapshot {
    fn default() -> Self {
        Self::new(None, Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

impl std::fmt::Debug for FrameSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSnapshot")
            .field("has_output", &self.output.is_some())
            .field("view", &self.view)
            .field("projection", &self.projection)
            .finish()
    }
}

/// Double-buffered frame state
#[derive(Debug, Default)]
pub struct FrameStateStore {
    current: FrameSnapshot,
    previous: FrameSnapshot,
    frames: u64,
}

impl FrameStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &FrameSnapshot {
        &self.current
    }

    pub fn previous(&self) -> &FrameSnapshot {
        &self.previous
    }

    /// Number of times the store has been advanced
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Install `next` as the current frame and demote the old current to previous
    ///
    /// `previous_output` replaces the demoted snapshot's output: the camera's other buffer,
    /// holding the prior frame's image, or `None` for single-buffered cameras.
    pub fn advance(&mut self, next: FrameSnapshot, previous_output: Option<SharedRenderTarget>) {
        let mut previous = std::mem::replace(&mut self.current, next);
        previous.output = previous_output;
        self.previous = previous;
        self.frames += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    fn assert_close(a: f32, b: f32) {
        assert!((a - b).abs() < 1e-3 * b.abs().max(1.0), "{} != {}", a, b);
    }

    #[test]
    fn test_planes_zero_to_one() {
        let projection = Mat4::perspective_rh(60f32.to_radians(), 1.5, 0.25, 10.0);
        let planes = ClipPlanes::from_projection(&projection, DepthRange::ZeroToOne).unwrap();
        assert_close(planes.near, 0.25);
        assert_close(planes.far, 10.0);
    }

    #[test]
    fn test_planes_negative_one_to_one() {
        let projection = Mat4::perspective_rh_gl(45f32.to_radians(), 1.0, 0.1, 1000.0);
        let planes =
            ClipPlanes::from_projection(&projection, DepthRange::NegativeOneToOne).unwrap();
        assert_close(planes.near, 0.1);
        assert_close(planes.far, 1000.0);
    }

    #[test]
    fn test_orthographic_rejected() {
        let projection = Mat4::orthographic_rh(-1.0, 1.0, -1.0, 1.0, 0.1, 10.0);
        assert_eq!(
            ClipPlanes::from_projection(&projection, DepthRange::ZeroToOne),
            Err(ProjectionError::NotPerspective)
        );
    }

    #[test]
    fn test_infinite_far_rejected() {
        let projection = Mat4::perspective_infinite_rh(1.0, 1.0, 0.1);
        assert!(matches!(
            ClipPlanes::from_projection(&projection, DepthRange::ZeroToOne),
            Err(ProjectionError::DegeneratePlanes { .. })
        ));
    }

    #[test]
    fn test_advance_demotes_current() {
        let mut store = FrameStateStore::new();
        let first = Mat4::look_at_rh(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        let second = Mat4::look_at_rh(Vec3::new(5.0, 0.0, 0.0), Vec3::ZERO, Vec3::Y);

        store.advance(FrameSnapshot::new(None, first, Mat4::IDENTITY), None);
        store.advance(FrameSnapshot::new(None, second, Mat4::IDENTITY), None);

        assert_eq!(store.previous().view, first);
        assert_eq!(store.current().view, second);
        assert_eq!(store.frames(), 2);
    }

    #[test]
    fn test_view_projection_product() {
        let view = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let projection = Mat4::perspective_rh(1.0, 1.0, 0.1, 100.0);
        let snapshot = FrameSnapshot::new(None, view, projection);
        assert_eq!(snapshot.view_projection, projection * view);
    }
}
