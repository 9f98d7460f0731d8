//! Settings for Wing Overlay
//!
//! All tuning constants of the pipeline live here. Every field carries a
//! serde default so partial settings files load cleanly.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::camera::FacingMode;

/// Errors while reading a settings file
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("Failed to read settings file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Top-level settings document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OverlaySettings {
    #[serde(default)]
    pub anchor: AnchorSettings,
    #[serde(default)]
    pub detection: DetectionSettings,
    #[serde(default)]
    pub assets: AssetSettings,
    #[serde(default)]
    pub occlusion: OcclusionSettings,
    #[serde(default)]
    pub scene: SceneSettings,
    #[serde(default)]
    pub camera: CameraSettings,
    #[serde(default)]
    pub models: ModelSettings,
}

impl OverlaySettings {
    /// Load settings from a JSON file
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let content = fs::read_to_string(path).map_err(|source| SettingsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse settings from a JSON string.
    ///
    /// Out-of-range numbers are replaced by their defaults.
    pub fn from_json(content: &str) -> Result<Self, serde_json::Error> {
        let settings: Self = serde_json::from_str(content)?;
        Ok(settings.sanitized())
    }

    /// Replace values the pipeline cannot work with
    pub fn sanitized(mut self) -> Self {
        let anchor = &mut self.anchor;
        anchor.smoothing = in_range(
            anchor.smoothing,
            0.0..=1.0,
            default_smoothing(),
            "anchor.smoothing",
        );
        anchor.tilt_pixel_range = positive(
            anchor.tilt_pixel_range,
            default_tilt_pixel_range(),
            "anchor.tilt_pixel_range",
        );
        anchor.max_tilt = in_range(
            anchor.max_tilt,
            0.0..=std::f32::consts::PI,
            default_max_tilt(),
            "anchor.max_tilt",
        );
        anchor.reference_viewport_height = positive(
            anchor.reference_viewport_height,
            default_reference_viewport_height(),
            "anchor.reference_viewport_height",
        );

        self.assets.load_timeout_secs = in_range(
            self.assets.load_timeout_secs,
            0.0..=MAX_LOAD_TIMEOUT_SECS,
            default_load_timeout_secs(),
            "assets.load_timeout_secs",
        );
        self.occlusion.threshold = in_range(
            self.occlusion.threshold,
            0.0..=1.0,
            default_occlusion_threshold(),
            "occlusion.threshold",
        );
        self.scene.fov_deg = in_range(
            self.scene.fov_deg,
            1.0..=179.0,
            default_fov_deg(),
            "scene.fov_deg",
        );
        self
    }

    /// Default settings file location (`<config_dir>/wing-overlay/settings.json`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("wing-overlay").join("settings.json"))
    }

    /// Load from `path`, or the default location, falling back to defaults.
    ///
    /// A missing or broken file never prevents startup.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => {
                    log::info!("No settings file found, using defaults");
                    return Self::default();
                }
            },
        };

        match Self::load(&path) {
            Ok(settings) => {
                log::info!("Loaded settings from {}", path.display());
                settings
            }
            Err(e) => {
                log::warn!("{}. Using defaults.", e);
                Self::default()
            }
        }
    }
}

/// Longest accepted asset load timeout
pub const MAX_LOAD_TIMEOUT_SECS: f32 = 600.0;

fn in_range(value: f32, range: std::ops::RangeInclusive<f32>, default: f32, name: &str) -> f32 {
    if range.contains(&value) {
        value
    } else {
        log::warn!("{} = {} is out of range {:?}, using {}", name, value, range, default);
        default
    }
}

fn positive(value: f32, default: f32, name: &str) -> f32 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        log::warn!("{} = {} must be positive, using {}", name, value, default);
        default
    }
}

/// Anchor smoothing and part placement tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSettings {
    /// Fraction of the remaining distance to target closed per update
    #[serde(default = "default_smoothing")]
    pub smoothing: f32,
    /// Both shoulders must exceed this confidence to form a pair
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    /// Shift from the shoulder line down to the attachment point (normalized units)
    #[serde(default = "default_vertical_shift")]
    pub vertical_shift: f32,
    /// World Z of the anchor
    #[serde(default = "default_anchor_depth")]
    pub anchor_depth: f32,
    /// Shoulder height difference (pixels) that maps to the maximum tilt
    #[serde(default = "default_tilt_pixel_range")]
    pub tilt_pixel_range: f32,
    /// Maximum tilt magnitude in radians
    #[serde(default = "default_max_tilt")]
    pub max_tilt: f32,
    /// Fraction of the half shoulder span used as the part offset
    #[serde(default = "default_offset_span_factor")]
    pub offset_span_factor: f32,
    /// Minimum horizontal offset of each part
    #[serde(default = "default_min_offset")]
    pub min_offset: f32,
    /// Base scale applied to both parts
    #[serde(default = "default_base_scale")]
    pub base_scale: f32,
    /// Viewport height at which the viewport factor reaches 1
    #[serde(default = "default_reference_viewport_height")]
    pub reference_viewport_height: f32,
    /// Extra scale along the depth axis (compensates for thin assets)
    #[serde(default = "default_depth_scale")]
    pub depth_scale: f32,
    /// Outward splay of each part in degrees
    #[serde(default = "default_splay_angle_deg")]
    pub splay_angle_deg: f32,
}

fn default_smoothing() -> f32 {
    0.6
}
fn default_confidence_threshold() -> f32 {
    0.4
}
fn default_vertical_shift() -> f32 {
    0.5
}
fn default_anchor_depth() -> f32 {
    -3.0
}
fn default_tilt_pixel_range() -> f32 {
    150.0
}
fn default_max_tilt() -> f32 {
    std::f32::consts::FRAC_PI_6
}
fn default_offset_span_factor() -> f32 {
    0.55
}
fn default_min_offset() -> f32 {
    0.25
}
fn default_base_scale() -> f32 {
    0.35
}
fn default_reference_viewport_height() -> f32 {
    800.0
}
fn default_depth_scale() -> f32 {
    1.5
}
fn default_splay_angle_deg() -> f32 {
    12.0
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            smoothing: default_smoothing(),
            confidence_threshold: default_confidence_threshold(),
            vertical_shift: default_vertical_shift(),
            anchor_depth: default_anchor_depth(),
            tilt_pixel_range: default_tilt_pixel_range(),
            max_tilt: default_max_tilt(),
            offset_span_factor: default_offset_span_factor(),
            min_offset: default_min_offset(),
            base_scale: default_base_scale(),
            reference_viewport_height: default_reference_viewport_height(),
            depth_scale: default_depth_scale(),
            splay_angle_deg: default_splay_angle_deg(),
        }
    }
}

/// Detector cadence and presence gating
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionSettings {
    /// Ticks between keypoint detections
    #[serde(default = "default_keypoint_interval")]
    pub keypoint_interval: u32,
    /// Ticks between presence detections
    #[serde(default = "default_presence_interval")]
    pub presence_interval: u32,
    /// Ticks between segmentation calls
    #[serde(default = "default_segmentation_interval")]
    pub segmentation_interval: u32,
    /// Minimum detection confidence for the presence gate (0.5-0.7)
    #[serde(default = "default_presence_min_confidence")]
    pub presence_min_confidence: f32,
    /// Whether the overlay requires a present face/person
    #[serde(default = "default_require_presence")]
    pub require_presence: bool,
    /// Run detectors on the frame thread instead of the blocking pool
    #[serde(default)]
    pub inline: bool,
}

fn default_keypoint_interval() -> u32 {
    2
}
fn default_presence_interval() -> u32 {
    10
}
fn default_segmentation_interval() -> u32 {
    3
}
fn default_presence_min_confidence() -> f32 {
    0.6
}
fn default_require_presence() -> bool {
    true
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            keypoint_interval: default_keypoint_interval(),
            presence_interval: default_presence_interval(),
            segmentation_interval: default_segmentation_interval(),
            presence_min_confidence: default_presence_min_confidence(),
            require_presence: default_require_presence(),
            inline: false,
        }
    }
}

/// Overlay asset locations and tier tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetSettings {
    #[serde(default = "default_point_cloud_left")]
    pub point_cloud_left: PathBuf,
    #[serde(default = "default_point_cloud_right")]
    pub point_cloud_right: PathBuf,
    #[serde(default = "default_mesh_left")]
    pub mesh_left: PathBuf,
    /// Mirrored from `mesh_left` when absent
    #[serde(default)]
    pub mesh_right: Option<PathBuf>,
    /// Upper bound on waiting for both point-cloud parts
    #[serde(default = "default_load_timeout_secs")]
    pub load_timeout_secs: f32,
    #[serde(default = "default_point_cloud_scale")]
    pub point_cloud_scale: f32,
    /// RGBA color of mesh parts
    #[serde(default = "default_mesh_color")]
    pub mesh_color: [f32; 4],
    /// RGBA color of the placeholder volumes (translucent)
    #[serde(default = "default_placeholder_color")]
    pub placeholder_color: [f32; 4],
    /// Width, thickness and length of each placeholder volume
    #[serde(default = "default_placeholder_size")]
    pub placeholder_size: [f32; 3],
}

fn default_point_cloud_left() -> PathBuf {
    PathBuf::from("assets/wing_left.ksplat")
}
fn default_point_cloud_right() -> PathBuf {
    PathBuf::from("assets/wing_right.ksplat")
}
fn default_mesh_left() -> PathBuf {
    PathBuf::from("assets/wing.obj")
}
fn default_load_timeout_secs() -> f32 {
    20.0
}
fn default_point_cloud_scale() -> f32 {
    1.0
}
fn default_mesh_color() -> [f32; 4] {
    [0.95, 0.95, 1.0, 1.0]
}
fn default_placeholder_color() -> [f32; 4] {
    [1.0, 1.0, 1.0, 0.6]
}
fn default_placeholder_size() -> [f32; 3] {
    [0.6, 0.05, 1.0]
}

impl Default for AssetSettings {
    fn default() -> Self {
        Self {
            point_cloud_left: default_point_cloud_left(),
            point_cloud_right: default_point_cloud_right(),
            mesh_left: default_mesh_left(),
            mesh_right: None,
            load_timeout_secs: default_load_timeout_secs(),
            point_cloud_scale: default_point_cloud_scale(),
            mesh_color: default_mesh_color(),
            placeholder_color: default_placeholder_color(),
            placeholder_size: default_placeholder_size(),
        }
    }
}

/// Occlusion pass capability and threshold
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcclusionSettings {
    /// Constrained deployments may disable the pass entirely
    #[serde(default = "default_occlusion_enabled")]
    pub enabled: bool,
    /// Mask intensity above which the person occludes the overlay
    #[serde(default = "default_occlusion_threshold")]
    pub threshold: f32,
}

fn default_occlusion_enabled() -> bool {
    true
}
fn default_occlusion_threshold() -> f32 {
    0.5
}

impl Default for OcclusionSettings {
    fn default() -> Self {
        Self {
            enabled: default_occlusion_enabled(),
            threshold: default_occlusion_threshold(),
        }
    }
}

/// Projection and plane distances (camera looks down -Z from the origin)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneSettings {
    /// Vertical field of view in degrees
    #[serde(default = "default_fov_deg")]
    pub fov_deg: f32,
    /// Distance of the occlusion surface from the camera
    #[serde(default = "default_occlusion_distance")]
    pub occlusion_distance: f32,
    /// Distance of the background video plane from the camera
    #[serde(default = "default_video_distance")]
    pub video_distance: f32,
}

fn default_fov_deg() -> f32 {
    50.0
}
fn default_occlusion_distance() -> f32 {
    2.0
}
fn default_video_distance() -> f32 {
    4.0
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            fov_deg: default_fov_deg(),
            occlusion_distance: default_occlusion_distance(),
            video_distance: default_video_distance(),
        }
    }
}

/// Camera selection and startup behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraSettings {
    #[serde(default)]
    pub preferred_facing: FacingMode,
    /// Device index used for the front (selfie) camera
    #[serde(default)]
    pub front_index: u32,
    /// Device index used for the rear camera
    #[serde(default = "default_rear_index")]
    pub rear_index: u32,
    #[serde(default = "default_request_width")]
    pub request_width: u32,
    #[serde(default = "default_request_height")]
    pub request_height: u32,
    /// Bounded wait for the first frame before falling back
    #[serde(default = "default_metadata_timeout_ms")]
    pub metadata_timeout_ms: u64,
    #[serde(default = "default_fallback_width")]
    pub fallback_width: u32,
    #[serde(default = "default_fallback_height")]
    pub fallback_height: u32,
}

fn default_rear_index() -> u32 {
    1
}
fn default_request_width() -> u32 {
    1280
}
fn default_request_height() -> u32 {
    720
}
fn default_metadata_timeout_ms() -> u64 {
    3000
}
fn default_fallback_width() -> u32 {
    640
}
fn default_fallback_height() -> u32 {
    480
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            preferred_facing: FacingMode::default(),
            front_index: 0,
            rear_index: default_rear_index(),
            request_width: default_request_width(),
            request_height: default_request_height(),
            metadata_timeout_ms: default_metadata_timeout_ms(),
            fallback_width: default_fallback_width(),
            fallback_height: default_fallback_height(),
        }
    }
}

/// ONNX model locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSettings {
    /// Searched next to the executable and in the working directory when unset
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    #[serde(default = "default_pose_model")]
    pub pose_model: String,
    #[serde(default = "default_segmentation_model")]
    pub segmentation_model: String,
    #[serde(default = "default_face_model")]
    pub face_model: String,
}

fn default_pose_model() -> String {
    "movenet_singlepose_lightning.onnx".to_string()
}
fn default_segmentation_model() -> String {
    "selfie_segmentation.onnx".to_string()
}
fn default_face_model() -> String {
    "face_detector_rfb_320.onnx".to_string()
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            model_dir: None,
            pose_model: default_pose_model(),
            segmentation_model: default_segmentation_model(),
            face_model: default_face_model(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = OverlaySettings::default();
        assert_eq!(settings.anchor.smoothing, 0.6);
        assert_eq!(settings.anchor.confidence_threshold, 0.4);
        assert_eq!(settings.anchor.min_offset, 0.25);
        assert_eq!(settings.occlusion.threshold, 0.5);
        assert_eq!(settings.assets.load_timeout_secs, 20.0);
        assert!(settings.occlusion.enabled);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings = OverlaySettings::from_json(
            r#"{ "anchor": { "vertical_shift": 0.3 }, "occlusion": { "enabled": false } }"#,
        )
        .unwrap();
        assert_eq!(settings.anchor.vertical_shift, 0.3);
        assert_eq!(settings.anchor.smoothing, 0.6);
        assert!(!settings.occlusion.enabled);
        assert_eq!(settings.detection.keypoint_interval, 2);
    }

    #[test]
    fn test_facing_mode_serialization() {
        let settings =
            OverlaySettings::from_json(r#"{ "camera": { "preferred_facing": "rear" } }"#).unwrap();
        assert_eq!(settings.camera.preferred_facing, FacingMode::Rear);
    }

    #[test]
    fn test_out_of_range_values_fall_back() {
        let settings = OverlaySettings::from_json(
            r#"{
                "anchor": { "tilt_pixel_range": 0, "max_tilt": -1.0, "smoothing": 0.3 },
                "assets": { "load_timeout_secs": 1e30 },
                "occlusion": { "threshold": 7.0 }
            }"#,
        )
        .unwrap();
        assert_eq!(settings.anchor.tilt_pixel_range, 150.0);
        assert_eq!(settings.anchor.max_tilt, std::f32::consts::FRAC_PI_6);
        assert_eq!(settings.anchor.smoothing, 0.3);
        assert_eq!(settings.assets.load_timeout_secs, 20.0);
        assert_eq!(settings.occlusion.threshold, 0.5);

        let settings =
            OverlaySettings::from_json(r#"{ "assets": { "load_timeout_secs": 45.5 } }"#).unwrap();
        assert_eq!(settings.assets.load_timeout_secs, 45.5);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let settings =
            OverlaySettings::load_or_default(Some(Path::new("/nonexistent/wing-overlay.json")));
        assert_eq!(settings.scene.fov_deg, 50.0);
    }
}
