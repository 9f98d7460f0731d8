//! Scene compositor
//!
//! The camera sits at the origin looking down -Z. From far to near: the
//! background video plane, the overlay parent, the occlusion surface.
//! Background draws first, then the depth-only occlusion pre-pass, then
//! the overlay parts, which are depth tested against it.

use glam::{Mat4, Quat, Vec2, Vec3};

use crate::anchor::{AnchorTransform, PartPlacement};
use crate::assets::{OverlayAsset, Side};
use crate::camera::FacingMode;
use crate::occlusion::{OcclusionCompositor, OcclusionUniforms};
use crate::settings::{AnchorSettings, OcclusionSettings, SceneSettings};

pub const RENDER_ORDER_BACKGROUND: u32 = 0;
pub const RENDER_ORDER_OCCLUSION: u32 = 1;
pub const RENDER_ORDER_OVERLAY: u32 = 2;

const NEAR_PLANE: f32 = 0.1;
const FAR_PLANE: f32 = 100.0;

/// Projection parameters shared by every surface
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SceneLayout {
    /// Vertical field of view in radians
    pub fov_y: f32,
    pub aspect: f32,
}

impl SceneLayout {
    pub fn new(settings: &SceneSettings, width: u32, height: u32) -> Self {
        Self {
            fov_y: settings.fov_deg.to_radians(),
            aspect: width.max(1) as f32 / height.max(1) as f32,
        }
    }

    /// World size of a plane exactly filling the view at `distance`
    pub fn plane_size_at(&self, distance: f32) -> Vec2 {
        let height = 2.0 * distance * (self.fov_y / 2.0).tan();
        Vec2::new(height * self.aspect, height)
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::perspective_rh(self.fov_y, self.aspect, NEAR_PLANE, FAR_PLANE)
    }
}

/// A view-filling quad at a fixed distance
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Surface {
    pub distance: f32,
    pub size: Vec2,
    pub render_order: u32,
}

impl Surface {
    pub fn at(layout: &SceneLayout, distance: f32, render_order: u32) -> Self {
        Self {
            distance,
            size: layout.plane_size_at(distance),
            render_order,
        }
    }

    /// Maps the unit quad ([-0.5, 0.5] in x/y) into the world
    pub fn model_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(
            Vec3::new(self.size.x, self.size.y, 1.0),
            Quat::IDENTITY,
            Vec3::new(0.0, 0.0, -self.distance),
        )
    }
}

/// One draw in submission order
#[derive(Debug, Clone, PartialEq)]
pub enum DrawItem {
    Background {
        model_view_proj: Mat4,
        flip_u: bool,
    },
    Occlusion(OcclusionUniforms),
    Part {
        side: Side,
        model: Mat4,
        model_view_proj: Mat4,
        color: [f32; 4],
    },
}

impl DrawItem {
    pub fn render_order(&self) -> u32 {
        match self {
            DrawItem::Background { .. } => RENDER_ORDER_BACKGROUND,
            DrawItem::Occlusion(_) => RENDER_ORDER_OCCLUSION,
            DrawItem::Part { .. } => RENDER_ORDER_OVERLAY,
        }
    }
}

/// Places the background, occlusion surface and overlay parts
pub struct SceneCompositor {
    layout: SceneLayout,
    facing: FacingMode,
    background: Surface,
    occlusion: OcclusionCompositor,
    overlay_parent: Mat4,
    part_models: [Mat4; 2],
}

impl SceneCompositor {
    pub fn new(
        settings: &SceneSettings,
        occlusion_settings: &OcclusionSettings,
        anchor_depth: f32,
        facing: FacingMode,
        viewport: (u32, u32),
    ) -> Self {
        let anchor_distance = -anchor_depth;
        if !(settings.occlusion_distance < anchor_distance
            && anchor_distance < settings.video_distance)
        {
            log::warn!(
                "Scene depths out of order: occlusion {} / overlay {} / video {}",
                settings.occlusion_distance,
                anchor_distance,
                settings.video_distance
            );
        }

        let layout = SceneLayout::new(settings, viewport.0, viewport.1);
        Self {
            layout,
            facing,
            background: Surface::at(&layout, settings.video_distance, RENDER_ORDER_BACKGROUND),
            occlusion: OcclusionCompositor::new(
                occlusion_settings,
                facing,
                &layout,
                settings.occlusion_distance,
            ),
            overlay_parent: Mat4::IDENTITY,
            part_models: [Mat4::IDENTITY; 2],
        }
    }

    pub fn layout(&self) -> &SceneLayout {
        &self.layout
    }

    pub fn background(&self) -> &Surface {
        &self.background
    }

    pub fn occlusion(&self) -> &OcclusionCompositor {
        &self.occlusion
    }

    pub fn occlusion_mut(&mut self) -> &mut OcclusionCompositor {
        &mut self.occlusion
    }

    /// Viewport changed: recompute plane sizes. Overlay placement is untouched.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.layout.aspect = width.max(1) as f32 / height.max(1) as f32;
        self.background = Surface::at(&self.layout, self.background.distance, RENDER_ORDER_BACKGROUND);
        self.occlusion.resize(&self.layout);
    }

    /// Camera looks down -Z from the origin, so view is identity
    pub fn view_projection(&self) -> Mat4 {
        self.layout.projection()
    }

    /// Anchor x/y (normalized) scaled to the frustum at the anchor depth
    pub fn anchor_world_position(&self, anchor: &AnchorTransform) -> Vec3 {
        let distance = (-anchor.position.z).max(0.0);
        let half = self.layout.plane_size_at(distance) / 2.0;
        Vec3::new(
            anchor.position.x * half.x,
            anchor.position.y * half.y,
            anchor.position.z,
        )
    }

    /// Reposition the parent node and both parts from the anchor
    pub fn update_overlay(
        &mut self,
        anchor: &AnchorTransform,
        asset: &OverlayAsset,
        settings: &AnchorSettings,
    ) {
        self.overlay_parent = Mat4::from_rotation_translation(
            // tilt_x is the shoulder-line roll, so it turns about the view axis
            Quat::from_rotation_z(anchor.tilt_x),
            self.anchor_world_position(anchor),
        );
        for (slot, side) in Side::BOTH.into_iter().enumerate() {
            let part = asset.part(side);
            let placement =
                PartPlacement::for_side(side, anchor, settings, part.geometry.scale_factor());
            self.part_models[slot] = self.overlay_parent
                * Mat4::from_scale_rotation_translation(
                    placement.scale,
                    placement.rotation,
                    placement.translation,
                );
        }
    }

    pub fn overlay_parent(&self) -> Mat4 {
        self.overlay_parent
    }

    pub fn part_model(&self, side: Side) -> Mat4 {
        match side {
            Side::Left => self.part_models[0],
            Side::Right => self.part_models[1],
        }
    }

    /// Draws for this frame, sorted by render order
    pub fn draw_list(&self, asset: &OverlayAsset) -> Vec<DrawItem> {
        let view_proj = self.view_projection();
        let mut items = vec![DrawItem::Background {
            model_view_proj: view_proj * self.background.model_matrix(),
            flip_u: self.facing.is_mirrored(),
        }];

        if self.occlusion.is_enabled() && self.occlusion.mask().is_some() {
            items.push(DrawItem::Occlusion(self.occlusion.uniforms(view_proj)));
        }

        for part in asset.parts().iter().filter(|p| p.visible) {
            let model = self.part_model(part.side);
            items.push(DrawItem::Part {
                side: part.side,
                model,
                model_view_proj: view_proj * model,
                color: part.color,
            });
        }

        items.sort_by_key(DrawItem::render_order);
        items
    }
}
