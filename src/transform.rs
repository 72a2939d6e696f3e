// SPDX-License-Identifier: MPL-2.0-only

//! Video placement math: fit, fill and stretch on top of the user's pan, zoom
//! and rotation.
//!
//! The renderer draws a unit quad spanning `[-1, 1]` on both axes. The matrix
//! produced here first blows that quad up to the video's native pixel size,
//! rotates it, scales it to the screen according to the [`ScalingMode`],
//! offsets it by the pan, and finally projects screen pixels to clip space.

use glam::{Mat4, Vec2, Vec3};
use vidpaper_config::{ScalingMode, Transform};

/// Everything that determines where the video lands on screen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub screen: (u32, u32),
    pub video: (u32, u32),
    pub scaling: ScalingMode,
    pub pan_x: f32,
    pub pan_y: f32,
    pub zoom: f32,
    pub rotation: f32,
}

impl Placement {
    #[must_use]
    pub fn new(
        screen: (u32, u32),
        video: (u32, u32),
        scaling: ScalingMode,
        transform: &Transform,
    ) -> Self {
        Self {
            screen,
            video,
            scaling,
            pan_x: transform.pan_x,
            pan_y: transform.pan_y,
            zoom: transform.zoom,
            rotation: transform.rotation,
        }
    }

    fn is_degenerate(&self) -> bool {
        self.screen.0 == 0 || self.screen.1 == 0 || self.video.0 == 0 || self.video.1 == 0
    }
}

/// Size of the rotated video's axis-aligned bounding box.
///
/// Positive rotation turns the content clockwise, so the angle is negated
/// before it reaches the counter-clockwise math convention.
#[must_use]
pub fn rotated_bounds(video_w: f32, video_h: f32, rotation: f32) -> Vec2 {
    let theta = -rotation.to_radians();
    let (sin, cos) = (theta.sin().abs(), theta.cos().abs());
    Vec2::new(video_w * cos + video_h * sin, video_w * sin + video_h * cos)
}

/// Per-axis scale that maps the rotated video onto the screen for a mode,
/// before the user's zoom is applied.
#[must_use]
pub fn fit_scale(placement: &Placement) -> Vec2 {
    if placement.is_degenerate() {
        return Vec2::ONE;
    }

    let (screen_w, screen_h) = (placement.screen.0 as f32, placement.screen.1 as f32);
    let bounds = rotated_bounds(
        placement.video.0 as f32,
        placement.video.1 as f32,
        placement.rotation,
    );

    let ratio_x = screen_w / bounds.x;
    let ratio_y = screen_h / bounds.y;

    match placement.scaling {
        ScalingMode::Stretch => Vec2::new(ratio_x, ratio_y),
        ScalingMode::Fill => Vec2::splat(ratio_x.max(ratio_y)),
        ScalingMode::Fit => Vec2::splat(ratio_x.min(ratio_y)),
    }
}

/// Model-view-projection matrix for drawing the unit quad.
///
/// Returns the identity matrix whenever either size is still unknown.
#[must_use]
pub fn compute_mvp(placement: &Placement) -> Mat4 {
    if placement.is_degenerate() {
        return Mat4::IDENTITY;
    }

    let (screen_w, screen_h) = (placement.screen.0 as f32, placement.screen.1 as f32);
    let (video_w, video_h) = (placement.video.0 as f32, placement.video.1 as f32);

    let projection = Mat4::orthographic_rh(
        -screen_w / 2.0,
        screen_w / 2.0,
        -screen_h / 2.0,
        screen_h / 2.0,
        -1.0,
        1.0,
    );

    let scale = fit_scale(placement) * placement.zoom;

    // Order matters: pan in screen pixels, fit, rotate, then quad to video pixels.
    projection
        * Mat4::from_translation(Vec3::new(
            placement.pan_x * screen_w / 2.0,
            placement.pan_y * screen_h / 2.0,
            0.0,
        ))
        * Mat4::from_scale(Vec3::new(scale.x, scale.y, 1.0))
        * Mat4::from_rotation_z(-placement.rotation.to_radians())
        * Mat4::from_scale(Vec3::new(video_w / 2.0, video_h / 2.0, 1.0))
}
