//! Occlusion compositor
//!
//! The latest segmentation mask becomes a depth-only surface between the
//! camera and the overlay. Where the mask exceeds the threshold the surface
//! writes depth and hides overlay fragments behind it; elsewhere the
//! fragment is discarded and nothing is written.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec2;

use crate::camera::FacingMode;
use crate::detection::SegmentationMask;
use crate::scene::{SceneLayout, Surface, RENDER_ORDER_OCCLUSION};
use crate::settings::OcclusionSettings;

/// Shader parameters of the occlusion pre-pass
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct OcclusionUniforms {
    pub model_view_proj: [[f32; 4]; 4],
    pub threshold: f32,
    /// 1.0 when the mask must be sampled at 1 - u
    pub flip_u: f32,
    pub _pad: [f32; 2],
}

/// Mask texels waiting for GPU upload
#[derive(Debug)]
pub struct MaskUpload<'a> {
    pub texels: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub generation: u64,
}

/// Owns the mask state and the occlusion surface geometry
pub struct OcclusionCompositor {
    enabled: bool,
    threshold: f32,
    facing: FacingMode,
    mask: Option<Arc<SegmentationMask>>,
    texels: Vec<u8>,
    generation: u64,
    uploaded_generation: u64,
    surface: Surface,
}

impl OcclusionCompositor {
    pub fn new(
        settings: &OcclusionSettings,
        facing: FacingMode,
        layout: &SceneLayout,
        distance: f32,
    ) -> Self {
        if !settings.enabled {
            log::info!("Occlusion pass disabled");
        }
        Self {
            enabled: settings.enabled,
            threshold: settings.threshold,
            facing,
            mask: None,
            texels: Vec::new(),
            generation: 0,
            uploaded_generation: 0,
            surface: Surface::at(layout, distance, RENDER_ORDER_OCCLUSION),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Replace the mask. Stale masks keep rendering until this is called.
    pub fn update_mask(&mut self, mask: SegmentationMask) {
        if !self.enabled {
            return;
        }
        self.texels = mask.to_texels();
        self.mask = Some(Arc::new(mask));
        self.generation += 1;
    }

    pub fn mask(&self) -> Option<&SegmentationMask> {
        self.mask.as_deref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether sampling mirrors U, in lockstep with the anchor mirroring
    pub fn flip_u(&self) -> bool {
        let already_mirrored = self.mask.as_ref().map(|m| m.mirrored).unwrap_or(false);
        self.facing.is_mirrored() && !already_mirrored
    }

    /// Mask coordinate for a point on the surface (u, v in [0, 1], v down)
    pub fn sample_uv(&self, u: f32, v: f32) -> (f32, f32) {
        if self.flip_u() {
            (1.0 - u, v)
        } else {
            (u, v)
        }
    }

    /// CPU rendition of the pre-pass test: true where depth is written
    pub fn occludes(&self, u: f32, v: f32) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(mask) = &self.mask else {
            return false;
        };
        let (su, sv) = self.sample_uv(u, v);
        mask.sample(su, sv) > self.threshold
    }

    /// Recompute the surface to fill the frustum at its depth
    pub fn resize(&mut self, layout: &SceneLayout) {
        self.surface = Surface::at(layout, self.surface.distance, RENDER_ORDER_OCCLUSION);
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn size(&self) -> Vec2 {
        self.surface.size
    }

    pub fn uniforms(&self, view_proj: glam::Mat4) -> OcclusionUniforms {
        OcclusionUniforms {
            model_view_proj: (view_proj * self.surface.model_matrix()).to_cols_array_2d(),
            threshold: self.threshold,
            flip_u: if self.flip_u() { 1.0 } else { 0.0 },
            _pad: [0.0; 2],
        }
    }

    /// Texels of a mask not yet uploaded, marking it uploaded
    pub fn take_upload(&mut self) -> Option<MaskUpload<'_>> {
        if self.generation == self.uploaded_generation {
            return None;
        }
        let mask = self.mask.as_ref()?;
        self.uploaded_generation = self.generation;
        Some(MaskUpload {
            texels: &self.texels,
            width: mask.width,
            height: mask.height,
            generation: self.generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::SceneSettings;

    fn layout() -> SceneLayout {
        SceneLayout::new(&SceneSettings::default(), 1280, 720)
    }

    /// Left half person, right half background
    fn half_mask() -> SegmentationMask {
        SegmentationMask::new(vec![1.0, 0.0, 1.0, 0.0], 2, 2)
    }

    fn compositor(facing: FacingMode) -> OcclusionCompositor {
        OcclusionCompositor::new(&OcclusionSettings::default(), facing, &layout(), 2.0)
    }

    #[test]
    fn test_threshold_decides_depth_write() {
        let mut occlusion = compositor(FacingMode::Rear);
        assert!(!occlusion.occludes(0.1, 0.5));
        occlusion.update_mask(half_mask());
        assert!(occlusion.occludes(0.1, 0.5));
        assert!(!occlusion.occludes(0.9, 0.5));

        // Exactly at threshold is not occluding
        occlusion.update_mask(SegmentationMask::new(vec![0.5], 1, 1));
        assert!(!occlusion.occludes(0.5, 0.5));
    }

    #[test]
    fn test_front_facing_flips_sampling() {
        let mut occlusion = compositor(FacingMode::Front);
        occlusion.update_mask(half_mask());
        assert!(occlusion.flip_u());
        assert!(!occlusion.occludes(0.1, 0.5));
        assert!(occlusion.occludes(0.9, 0.5));

        let mut mirrored = half_mask();
        mirrored.mirrored = true;
        occlusion.update_mask(mirrored);
        assert!(!occlusion.flip_u());
        assert!(occlusion.occludes(0.1, 0.5));
    }

    #[test]
    fn test_surface_matches_plane_sizing() {
        let mut occlusion = compositor(FacingMode::Rear);
        assert_eq!(occlusion.size(), layout().plane_size_at(2.0));

        let portrait = SceneLayout::new(&SceneSettings::default(), 720, 1280);
        occlusion.resize(&portrait);
        assert_eq!(occlusion.size(), portrait.plane_size_at(2.0));
        assert_eq!(occlusion.surface().distance, 2.0);
    }

    #[test]
    fn test_upload_once_per_generation() {
        let mut occlusion = compositor(FacingMode::Rear);
        assert!(occlusion.take_upload().is_none());

        occlusion.update_mask(half_mask());
        let upload = occlusion.take_upload().unwrap();
        assert_eq!(upload.texels, &[255, 0, 255, 0]);
        assert_eq!((upload.width, upload.height, upload.generation), (2, 2, 1));
        assert!(occlusion.take_upload().is_none());
    }

    #[test]
    fn test_disabled_never_occludes() {
        let settings = OcclusionSettings {
            enabled: false,
            ..Default::default()
        };
        let mut occlusion = OcclusionCompositor::new(&settings, FacingMode::Rear, &layout(), 2.0);
        occlusion.update_mask(half_mask());
        assert!(!occlusion.occludes(0.1, 0.5));
        assert_eq!(occlusion.generation(), 0);
    }
}
