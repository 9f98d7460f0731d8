//! Detection module
//!
//! Keypoint, segmentation and presence sources are black boxes behind the
//! traits below. The frame driver only sees their reduced outputs.

pub mod hub;
pub mod onnx;
pub mod throttle;

pub use hub::{DetectorEvent, DetectorHub, DetectorOutput, Detectors, Dispatch};
pub use throttle::DetectorThrottle;

use thiserror::Error;

use crate::camera::{CameraFrame, FacingMode};

/// Errors raised by detector sources. Always non-fatal.
#[derive(Error, Debug, Clone)]
pub enum DetectorError {
    #[error("Model unavailable: {0}")]
    Model(String),
    #[error("Inference failed: {0}")]
    Inference(String),
}

/// Which detector produced a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorKind {
    Keypoints,
    Presence,
    Segmentation,
}

impl DetectorKind {
    pub const ALL: [DetectorKind; 3] = [
        DetectorKind::Keypoints,
        DetectorKind::Presence,
        DetectorKind::Segmentation,
    ];
}

/// A single keypoint in image pixel space
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,
}

impl Keypoint {
    pub fn new(x: f32, y: f32, confidence: f32) -> Self {
        Self { x, y, confidence }
    }

    pub fn is_valid(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}

/// Both shoulders of one person. Never holds a half-valid pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShoulderPair {
    pub left: Keypoint,
    pub right: Keypoint,
}

impl ShoulderPair {
    /// Build a pair only when both shoulders reach `threshold`
    pub fn from_keypoints(left: Keypoint, right: Keypoint, threshold: f32) -> Option<Self> {
        if left.is_valid(threshold) && right.is_valid(threshold) {
            Some(Self { left, right })
        } else {
            None
        }
    }
}

/// Foreground probability mask aligned to the camera frame
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationMask {
    /// Row-major foreground probability (0.0 = background, 1.0 = person)
    pub data: Vec<f32>,
    pub width: u32,
    pub height: u32,
    /// The source already returned the mask in mirrored (display) space
    pub mirrored: bool,
}

impl SegmentationMask {
    pub fn new(data: Vec<f32>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            mirrored: false,
        }
    }

    /// Mask value at normalized coordinates
    pub fn sample(&self, u: f32, v: f32) -> f32 {
        if self.width == 0 || self.height == 0 {
            return 0.0;
        }
        let px = (u.clamp(0.0, 1.0) * self.width as f32) as u32;
        let py = (v.clamp(0.0, 1.0) * self.height as f32) as u32;
        let idx = (py.min(self.height - 1) * self.width + px.min(self.width - 1)) as usize;
        self.data.get(idx).copied().unwrap_or(0.0)
    }

    /// Quantize to 8-bit texels for GPU upload
    pub fn to_texels(&self) -> Vec<u8> {
        self.data
            .iter()
            .map(|&v| (v.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect()
    }
}

/// One presence (face) detection
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceDetection {
    pub confidence: f32,
    /// Normalized box (x0, y0, x1, y1) when the source provides one
    pub bounds: Option<[f32; 4]>,
}

/// Reduces presence detections to a boolean
#[derive(Debug, Clone, Copy)]
pub struct PresenceGate {
    pub min_confidence: f32,
}

impl PresenceGate {
    pub fn new(min_confidence: f32) -> Self {
        Self { min_confidence }
    }

    pub fn evaluate(&self, detections: &[PresenceDetection]) -> bool {
        detections
            .iter()
            .any(|d| d.confidence >= self.min_confidence)
    }
}

/// Estimates shoulder keypoints for the most prominent person
pub trait KeypointSource: Send {
    fn estimate(&mut self, frame: &CameraFrame) -> Result<Option<ShoulderPair>, DetectorError>;
}

/// Produces a foreground mask for a frame
pub trait SegmentationSource: Send {
    /// `facing` lets sources that can mirror their output do so; they must
    /// then set [`SegmentationMask::mirrored`].
    fn segment(
        &mut self,
        frame: &CameraFrame,
        facing: FacingMode,
    ) -> Result<SegmentationMask, DetectorError>;
}

/// Detects faces/people for the presence gate
pub trait PresenceSource: Send {
    fn estimate(&mut self, frame: &CameraFrame) -> Result<Vec<PresenceDetection>, DetectorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pair_requires_both_shoulders() {
        let good = Keypoint::new(100.0, 200.0, 0.9);
        let weak = Keypoint::new(300.0, 200.0, 0.2);
        assert!(ShoulderPair::from_keypoints(good, weak, 0.4).is_none());
        assert!(ShoulderPair::from_keypoints(weak, good, 0.4).is_none());
        assert!(ShoulderPair::from_keypoints(good, good, 0.4).is_some());
    }

    #[test]
    fn test_presence_gate() {
        let gate = PresenceGate::new(0.6);
        assert!(!gate.evaluate(&[]));
        assert!(!gate.evaluate(&[PresenceDetection {
            confidence: 0.55,
            bounds: None
        }]));
        assert!(gate.evaluate(&[
            PresenceDetection {
                confidence: 0.2,
                bounds: None
            },
            PresenceDetection {
                confidence: 0.7,
                bounds: None
            },
        ]));
    }

    #[test]
    fn test_mask_sample_and_texels() {
        let mask = SegmentationMask::new(vec![0.0, 1.0, 0.5, 0.25], 2, 2);
        assert_eq!(mask.sample(0.0, 0.0), 0.0);
        assert_eq!(mask.sample(0.99, 0.0), 1.0);
        assert_eq!(mask.sample(0.0, 0.99), 0.5);
        assert_eq!(mask.sample(2.0, 2.0), 0.25);
        assert_eq!(mask.to_texels(), vec![0, 255, 128, 64]);
    }
}
