//! Transform component

use bevy_ecs::prelude::*;
use glam::{Mat3, Mat4, Quat, Vec3};

/// Transform component for positioning objects in 3D space
#[derive(Component, Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for Transform {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl Transform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    pub fn from_position_scale(position: Vec3, scale: Vec3) -> Self {
        Self {
            position,
            scale,
            ..Default::default()
        }
    }

    /// Transform at `position` whose forward axis points at `target`
    pub fn looking_at(position: Vec3, target: Vec3, up: Vec3) -> Self {
        let mut transform = Self::from_position(position);
        transform.look_at(target, up);
        transform
    }

    /// World matrix of this transform
    pub fn matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.position)
    }

    /// Inverse-transpose of the world matrix's upper 3x3
    pub fn normal_matrix(&self) -> Mat3 {
        Mat3::from_mat4(self.matrix().inverse().transpose())
    }

    /// Get forward direction (local -Z in world space)
    pub fn forward(&self) -> Vec3 {
        self.rotation * -Vec3::Z
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn translate(&mut self, offset: Vec3) {
        self.position += offset;
    }

    /// Rotate around an axis
    pub fn rotate_axis(&mut self, axis: Vec3, angle: f32) {
        let delta = Quat::from_axis_angle(axis, angle);
        self.rotation = delta * self.rotation;
    }

    /// Look at a target position
    pub fn look_at(&mut self, target: Vec3, up: Vec3) {
        let forward = (target - self.position).normalize();
        let right = forward.cross(up).normalize();
        let up = right.cross(forward);

        self.rotation = Quat::from_mat3(&Mat3::from_cols(right, up, -forward));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_look_at_forward() {
        let transform = Transform::looking_at(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO, Vec3::Y);
        assert!((transform.forward() - -Vec3::Z).length() < 1e-5);
        assert!((transform.up() - Vec3::Y).length() < 1e-5);
    }

    #[test]
    fn test_view_matches_look_at_rh() {
        let eye = Vec3::new(3.0, 4.0, 5.0);
        let transform = Transform::looking_at(eye, Vec3::ZERO, Vec3::Y);
        let expected = Mat4::look_at_rh(eye, Vec3::ZERO, Vec3::Y);
        assert!(transform.matrix().inverse().abs_diff_eq(expected, 1e-4));
    }

    #[test]
    fn test_normal_matrix_uniform_scale() {
        let transform = Transform::from_position_scale(Vec3::ONE, Vec3::splat(2.0));
        let normal = transform.normal_matrix() * Vec3::Y;
        assert!((normal.normalize() - Vec3::Y).length() < 1e-5);
    }
}
