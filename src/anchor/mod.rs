//! Anchor smoothing
//!
//! Turns raw shoulder keypoints into a stable transform for the overlay
//! parent node. Position and tilt are exponentially smoothed; offset and
//! scale track the current input directly.

use glam::{Quat, Vec3};

use crate::assets::Side;
use crate::camera::FacingMode;
use crate::detection::ShoulderPair;
use crate::settings::AnchorSettings;

/// Smoothed placement of the overlay parent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnchorTransform {
    /// x/y in normalized device units, z in world units
    pub position: Vec3,
    /// Roll of the shoulder line in radians, clamped to the configured maximum
    pub tilt_x: f32,
    /// Distance of each part from the parent along local X
    pub horizontal_offset: f32,
    pub scale: f32,
}

/// Dimensions the anchor is computed against
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameGeometry {
    pub frame_width: u32,
    pub frame_height: u32,
    pub viewport_height: f32,
}

impl FrameGeometry {
    pub fn aspect(&self) -> f32 {
        self.frame_width as f32 / self.frame_height.max(1) as f32
    }
}

/// Pixel coordinates to [-1, 1] device space (Y up)
pub fn normalize(px: f32, py: f32, width: u32, height: u32) -> (f32, f32) {
    let w = width.max(1) as f32;
    let h = height.max(1) as f32;
    ((px / w) * 2.0 - 1.0, -(py / h) * 2.0 + 1.0)
}

/// Target tilt for a shoulder height difference, mirrored for front cameras
pub fn tilt_target(pair: &ShoulderPair, settings: &AnchorSettings, facing: FacingMode) -> f32 {
    let y_diff = pair.left.y - pair.right.y;
    let raw = (y_diff / settings.tilt_pixel_range) * settings.max_tilt;
    raw.clamp(-settings.max_tilt, settings.max_tilt) * facing.mirror_sign()
}

/// Half the normalized shoulder span, floored so the parts never collapse
pub fn horizontal_offset(
    pair: &ShoulderPair,
    width: u32,
    height: u32,
    settings: &AnchorSettings,
    facing: FacingMode,
) -> f32 {
    let (left_x, _) = normalize(pair.left.x, pair.left.y, width, height);
    let (right_x, _) = normalize(pair.right.x, pair.right.y, width, height);
    let span = (facing.mirror_ndc_x(right_x) - facing.mirror_ndc_x(left_x)).abs();
    (span / 2.0 * settings.offset_span_factor).max(settings.min_offset)
}

/// Base scale banded by video aspect and reduced on short viewports
pub fn overlay_scale(geometry: &FrameGeometry, settings: &AnchorSettings) -> f32 {
    let aspect = geometry.aspect();
    let aspect_factor = if aspect < 1.0 {
        0.85
    } else if aspect > 1.7 {
        1.1
    } else {
        1.0
    };
    let viewport_factor = (geometry.viewport_height / settings.reference_viewport_height).min(1.0);
    aspect_factor * viewport_factor * settings.base_scale
}

/// Per-session smoothing state
#[derive(Debug, Clone)]
pub struct AnchorSmoother {
    settings: AnchorSettings,
    transform: AnchorTransform,
}

impl AnchorSmoother {
    pub fn new(settings: AnchorSettings) -> Self {
        let transform = Self::initial(&settings);
        Self {
            settings,
            transform,
        }
    }

    fn initial(settings: &AnchorSettings) -> AnchorTransform {
        AnchorTransform {
            position: Vec3::ZERO,
            tilt_x: 0.0,
            horizontal_offset: settings.min_offset,
            scale: settings.base_scale,
        }
    }

    pub fn transform(&self) -> AnchorTransform {
        self.transform
    }

    pub fn settings(&self) -> &AnchorSettings {
        &self.settings
    }

    /// Forget all smoothing (camera switch)
    pub fn reset(&mut self) {
        self.transform = Self::initial(&self.settings);
    }

    /// Raw target position for a pair, before smoothing
    pub fn target_position(&self, pair: &ShoulderPair, geometry: &FrameGeometry, facing: FacingMode) -> Vec3 {
        let (lx, ly) = normalize(pair.left.x, pair.left.y, geometry.frame_width, geometry.frame_height);
        let (rx, ry) = normalize(pair.right.x, pair.right.y, geometry.frame_width, geometry.frame_height);
        let mid_x = facing.mirror_ndc_x((lx + rx) / 2.0);
        let mid_y = (ly + ry) / 2.0 - self.settings.vertical_shift;
        Vec3::new(mid_x, mid_y, self.settings.anchor_depth)
    }

    /// Move one smoothing step toward the pair's target
    pub fn update(
        &mut self,
        pair: &ShoulderPair,
        geometry: &FrameGeometry,
        facing: FacingMode,
    ) -> AnchorTransform {
        let alpha = self.settings.smoothing;

        let target = self.target_position(pair, geometry, facing);
        self.transform.position += (target - self.transform.position) * alpha;

        let tilt = tilt_target(pair, &self.settings, facing);
        self.transform.tilt_x += (tilt - self.transform.tilt_x) * alpha;

        self.transform.horizontal_offset = horizontal_offset(
            pair,
            geometry.frame_width,
            geometry.frame_height,
            &self.settings,
            facing,
        );
        self.transform.scale = overlay_scale(geometry, &self.settings);

        self.transform
    }
}

/// Local transform of one part relative to the anchor parent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PartPlacement {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl PartPlacement {
    /// `tier_scale` normalizes the asset's native size; it never depends on
    /// which tier is active beyond that factor.
    pub fn for_side(
        side: Side,
        anchor: &AnchorTransform,
        settings: &AnchorSettings,
        tier_scale: f32,
    ) -> Self {
        let sign = side.sign();
        let splay = settings.splay_angle_deg.to_radians();
        // Stand the flat asset upright, then splay outward per side
        let rotation =
            Quat::from_rotation_y(sign * splay) * Quat::from_rotation_x(std::f32::consts::FRAC_PI_2);
        let s = anchor.scale * tier_scale;
        Self {
            translation: Vec3::new(sign * anchor.horizontal_offset, 0.0, 0.0),
            rotation,
            scale: Vec3::new(s, s, s * settings.depth_scale),
        }
    }
}
