//! Overlay assets
//!
//! Whatever tier loads, the overlay is always exactly two symmetric parts,
//! one per side. Placement code only relies on [`OverlayPart`] and its
//! scale factor, never on the tier.

pub mod container;
pub mod mesh;
pub mod provider;

pub use container::{decode_splat_container, ContainerError, SplatCloud};
pub use mesh::{parse_obj, MeshData, MeshError};
pub use provider::{describe, AssetProvider, AssetSource, FileAssetSource};

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Which side of the anchor a part sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const BOTH: [Side; 2] = [Side::Left, Side::Right];

    /// Direction along the anchor's local X axis
    pub fn sign(self) -> f32 {
        match self {
            Side::Left => -1.0,
            Side::Right => 1.0,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
        }
    }
}

/// Asset tiers in priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetTier {
    PointCloud,
    Mesh,
    Primitive,
}

impl std::fmt::Display for AssetTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssetTier::PointCloud => write!(f, "point-cloud"),
            AssetTier::Mesh => write!(f, "mesh"),
            AssetTier::Primitive => write!(f, "primitive"),
        }
    }
}

/// Renderable data of one part
#[derive(Debug, Clone)]
pub enum PartGeometry {
    PointCloud { cloud: SplatCloud, unit_scale: f32 },
    Mesh(MeshData),
    Primitive(MeshData),
}

impl PartGeometry {
    pub fn tier(&self) -> AssetTier {
        match self {
            PartGeometry::PointCloud { .. } => AssetTier::PointCloud,
            PartGeometry::Mesh(_) => AssetTier::Mesh,
            PartGeometry::Primitive(_) => AssetTier::Primitive,
        }
    }

    /// Multiplier bringing the native asset size to placement units
    pub fn scale_factor(&self) -> f32 {
        match self {
            PartGeometry::PointCloud { unit_scale, .. } => *unit_scale,
            PartGeometry::Mesh(mesh) => {
                let extent = mesh.largest_extent();
                if extent > f32::EPSILON {
                    1.0 / extent
                } else {
                    1.0
                }
            }
            PartGeometry::Primitive(_) => 1.0,
        }
    }
}

/// One of the two symmetric parts
#[derive(Debug, Clone)]
pub struct OverlayPart {
    pub side: Side,
    pub visible: bool,
    pub geometry: PartGeometry,
    /// RGBA tint (alpha < 1 renders translucent)
    pub color: [f32; 4],
}

/// The active overlay: one tier, two parts
#[derive(Debug, Clone)]
pub struct OverlayAsset {
    tier: AssetTier,
    parts: [OverlayPart; 2],
}

impl OverlayAsset {
    /// Build from per-side geometry; parts start hidden
    pub fn new(left: PartGeometry, right: PartGeometry, color: [f32; 4]) -> Self {
        let tier = left.tier();
        debug_assert_eq!(tier, right.tier());
        let part = |side, geometry| OverlayPart {
            side,
            visible: false,
            geometry,
            color,
        };
        Self {
            tier,
            parts: [part(Side::Left, left), part(Side::Right, right)],
        }
    }

    pub fn tier(&self) -> AssetTier {
        self.tier
    }

    pub fn parts(&self) -> &[OverlayPart; 2] {
        &self.parts
    }

    pub fn part(&self, side: Side) -> &OverlayPart {
        match side {
            Side::Left => &self.parts[0],
            Side::Right => &self.parts[1],
        }
    }

    pub fn part_mut(&mut self, side: Side) -> &mut OverlayPart {
        match side {
            Side::Left => &mut self.parts[0],
            Side::Right => &mut self.parts[1],
        }
    }

    pub fn set_visible(&mut self, visible: bool) {
        for part in &mut self.parts {
            part.visible = visible;
        }
    }

    pub fn is_visible(&self) -> bool {
        self.parts.iter().any(|p| p.visible)
    }
}

/// Why a tier failed to load. Never surfaced beyond the provider.
#[derive(Error, Debug)]
pub enum AssetError {
    #[error("Asset not found: {0}")]
    NotFound(PathBuf),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed container {path}: {source}")]
    Container {
        path: PathBuf,
        #[source]
        source: ContainerError,
    },
    #[error("Malformed mesh {path}: {source}")]
    Mesh {
        path: PathBuf,
        #[source]
        source: MeshError,
    },
    #[error("No renderable content in {0}")]
    Empty(PathBuf),
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_factors() {
        let mesh = MeshData::box_volume([4.0, 1.0, 2.0]);
        assert_eq!(PartGeometry::Mesh(mesh.clone()).scale_factor(), 0.25);
        assert_eq!(PartGeometry::Primitive(mesh).scale_factor(), 1.0);
        let cloud = PartGeometry::PointCloud {
            cloud: SplatCloud::default(),
            unit_scale: 0.8,
        };
        assert_eq!(cloud.scale_factor(), 0.8);
    }

    #[test]
    fn test_visibility_toggles_both_parts() {
        let geometry = PartGeometry::Primitive(MeshData::box_volume([1.0, 1.0, 1.0]));
        let mut asset = OverlayAsset::new(geometry.clone(), geometry, [1.0; 4]);
        assert!(!asset.is_visible());
        asset.set_visible(true);
        assert!(asset.part(Side::Left).visible && asset.part(Side::Right).visible);
        asset.part_mut(Side::Right).visible = false;
        assert!(asset.is_visible());
        assert_eq!(asset.tier(), AssetTier::Primitive);
    }
}
