// SPDX-License-Identifier: CEPL-1.0
//! Transforms for the single spinning mesh.

use glam::{Mat4, Vec3};

/// Degrees per second the model turns about +Z.
pub const SPIN_DEG_PER_SEC: f32 = 90.0;
pub const FOV_Y_DEG: f32 = 45.0;
pub const Z_NEAR: f32 = 0.1;
pub const Z_FAR: f32 = 10.0;

const EYE: Vec3 = Vec3::new(2.0, 2.0, 2.0);

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mvp {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl Mvp {
    /// Model rotated by elapsed time, fixed look-at from (2,2,2) with +Z up,
    /// and a perspective with clip-space Y pointing down.
    pub fn spinning(elapsed_secs: f32, width: u32, height: u32) -> Self {
        Self {
            model: model_rotation(elapsed_secs),
            view: fixed_view(),
            proj: perspective_y_down(FOV_Y_DEG.to_radians(), aspect(width, height), Z_NEAR, Z_FAR),
        }
    }
}

pub fn model_rotation(elapsed_secs: f32) -> Mat4 {
    Mat4::from_rotation_z(elapsed_secs * SPIN_DEG_PER_SEC.to_radians())
}

pub fn fixed_view() -> Mat4 {
    Mat4::look_at_rh(EYE, Vec3::ZERO, Vec3::Z)
}

/// Right-handed, depth 0..1, with the Y scale negated so +Y is up on screen
/// once the image reaches a top-left-origin framebuffer.
pub fn perspective_y_down(fov_y_rad: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(fov_y_rad, aspect, near, far);
    proj.y_axis.y *= -1.0;
    proj
}

/// Width over height; a collapsed dimension yields 1.0.
pub fn aspect(width: u32, height: u32) -> f32 {
    if width == 0 || height == 0 {
        1.0
    } else {
        width as f32 / height as f32
    }
}
