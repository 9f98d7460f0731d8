//! ONNX Runtime detector sources
//!
//! Pose keypoints (MoveNet single-pose), person segmentation (MediaPipe
//! selfie segmentation) and face presence (UltraFace RFB-320). A model that
//! fails to load leaves its detector slot empty; the pipeline keeps running
//! without it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;

use super::{
    DetectorError, Detectors, Keypoint, KeypointSource, PresenceDetection, PresenceSource,
    SegmentationMask, SegmentationSource, ShoulderPair,
};
use crate::camera::{CameraFrame, FacingMode};
use crate::settings::ModelSettings;

const POSE_SIZE: u32 = 192;
const LEFT_SHOULDER: usize = 5;
const RIGHT_SHOULDER: usize = 6;

const SEG_WIDTH: u32 = 256;
const SEG_HEIGHT: u32 = 256;

const FACE_WIDTH: u32 = 320;
const FACE_HEIGHT: u32 = 240;
/// Face candidates below this score are dropped before the presence gate
const FACE_MIN_SCORE: f32 = 0.3;
const FACE_MAX_DETECTIONS: usize = 16;

fn load_session(path: &Path) -> Result<Session, DetectorError> {
    if !path.exists() {
        return Err(DetectorError::Model(format!("{} not found", path.display())));
    }
    Session::builder()
        .map_err(|e| DetectorError::Model(format!("Failed to create session builder: {}", e)))?
        .with_intra_threads(2)
        .map_err(|e| DetectorError::Model(format!("Failed to set threads: {}", e)))?
        .commit_from_file(path)
        .map_err(|e| DetectorError::Model(format!("Failed to load {}: {}", path.display(), e)))
}

/// Run a single-input model and copy every f32 output out of the session
fn run_model(session: &mut Session, input: Array4<f32>) -> Result<Vec<Vec<f32>>, DetectorError> {
    let input_tensor = Tensor::from_array(input)
        .map_err(|e| DetectorError::Inference(format!("Failed to create tensor: {}", e)))?;

    let outputs = session
        .run(ort::inputs![input_tensor])
        .map_err(|e| DetectorError::Inference(e.to_string()))?;

    let mut result = Vec::new();
    for (name, value) in outputs.iter() {
        let (_shape, data) = value.try_extract_tensor::<f32>().map_err(|e| {
            DetectorError::Inference(format!("Failed to extract output {}: {}", name, e))
        })?;
        result.push(data.to_vec());
    }
    Ok(result)
}

/// Resize to NHWC RGB floats, `scale` applied to each 0-255 channel value
fn preprocess_nhwc(
    frame: &CameraFrame,
    width: u32,
    height: u32,
    scale: f32,
) -> Result<Array4<f32>, DetectorError> {
    let rgb: Vec<f32> = frame
        .resample(width, height, 3)
        .into_iter()
        .map(|v| v as f32 * scale)
        .collect();
    Array4::from_shape_vec((1, height as usize, width as usize, 3), rgb)
        .map_err(|e| DetectorError::Inference(format!("Failed to create input array: {}", e)))
}

/// MoveNet single-pose shoulder estimator
pub struct OnnxPoseKeypoints {
    session: Session,
    confidence_threshold: f32,
}

impl OnnxPoseKeypoints {
    pub fn load(path: &Path, confidence_threshold: f32) -> Result<Self, DetectorError> {
        Ok(Self {
            session: load_session(path)?,
            confidence_threshold,
        })
    }
}

impl KeypointSource for OnnxPoseKeypoints {
    fn estimate(&mut self, frame: &CameraFrame) -> Result<Option<ShoulderPair>, DetectorError> {
        let input = preprocess_nhwc(frame, POSE_SIZE, POSE_SIZE, 1.0)?;
        let outputs = run_model(&mut self.session, input)?;
        let data = outputs
            .first()
            .ok_or_else(|| DetectorError::Inference("No output from pose model".to_string()))?;

        // [1, 1, 17, 3] as (y, x, score), normalized to the input image
        let keypoint = |index: usize| -> Option<Keypoint> {
            let base = index * 3;
            let values = data.get(base..base + 3)?;
            Some(Keypoint::new(
                values[1] * frame.width as f32,
                values[0] * frame.height as f32,
                values[2],
            ))
        };

        let (Some(left), Some(right)) = (keypoint(LEFT_SHOULDER), keypoint(RIGHT_SHOULDER)) else {
            return Err(DetectorError::Inference(format!(
                "Pose output too short: {} values",
                data.len()
            )));
        };

        Ok(ShoulderPair::from_keypoints(
            left,
            right,
            self.confidence_threshold,
        ))
    }
}

/// Selfie segmentation (256x256 NHWC input, single-channel mask output)
pub struct OnnxSegmentation {
    session: Session,
}

impl OnnxSegmentation {
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        Ok(Self {
            session: load_session(path)?,
        })
    }
}

impl SegmentationSource for OnnxSegmentation {
    fn segment(
        &mut self,
        frame: &CameraFrame,
        _facing: FacingMode,
    ) -> Result<SegmentationMask, DetectorError> {
        let input = preprocess_nhwc(frame, SEG_WIDTH, SEG_HEIGHT, 1.0 / 255.0)?;
        let outputs = run_model(&mut self.session, input)?;
        let data = outputs.into_iter().next().ok_or_else(|| {
            DetectorError::Inference("No output from segmentation model".to_string())
        })?;

        let expected = (SEG_WIDTH * SEG_HEIGHT) as usize;
        if data.len() < expected {
            return Err(DetectorError::Inference(format!(
                "Segmentation output has {} values, expected {}",
                data.len(),
                expected
            )));
        }

        let mask = data
            .into_iter()
            .take(expected)
            .map(|v| v.clamp(0.0, 1.0))
            .collect();

        // Returned in camera space; the compositor mirrors sampling
        Ok(SegmentationMask::new(mask, SEG_WIDTH, SEG_HEIGHT))
    }
}

/// UltraFace face detector used as the presence signal
pub struct OnnxFacePresence {
    session: Session,
}

impl OnnxFacePresence {
    pub fn load(path: &Path) -> Result<Self, DetectorError> {
        Ok(Self {
            session: load_session(path)?,
        })
    }

    /// NCHW, (p - 127) / 128
    fn preprocess(frame: &CameraFrame) -> Result<Array4<f32>, DetectorError> {
        let rgb = frame.resample(FACE_WIDTH, FACE_HEIGHT, 3);
        let plane = (FACE_WIDTH * FACE_HEIGHT) as usize;
        let mut output = vec![0.0f32; plane * 3];
        for (pixel, chunk) in rgb.chunks_exact(3).enumerate() {
            for (channel, &value) in chunk.iter().enumerate() {
                output[channel * plane + pixel] = (value as f32 - 127.0) / 128.0;
            }
        }
        Array4::from_shape_vec((1, 3, FACE_HEIGHT as usize, FACE_WIDTH as usize), output)
            .map_err(|e| DetectorError::Inference(format!("Failed to create input array: {}", e)))
    }
}

impl PresenceSource for OnnxFacePresence {
    fn estimate(&mut self, frame: &CameraFrame) -> Result<Vec<PresenceDetection>, DetectorError> {
        let input = Self::preprocess(frame)?;
        let outputs = run_model(&mut self.session, input)?;
        let (Some(scores), Some(boxes)) = (outputs.first(), outputs.get(1)) else {
            return Err(DetectorError::Inference(format!(
                "Face model returned {} outputs, expected 2",
                outputs.len()
            )));
        };

        Ok(decode_faces(scores, boxes))
    }
}

/// Scores are [N, 2] (background, face), boxes [N, 4] normalized corners
fn decode_faces(scores: &[f32], boxes: &[f32]) -> Vec<PresenceDetection> {
    let mut detections: Vec<PresenceDetection> = scores
        .chunks_exact(2)
        .zip(boxes.chunks_exact(4))
        .filter(|(score, _)| score[1] > FACE_MIN_SCORE)
        .map(|(score, b)| PresenceDetection {
            confidence: score[1],
            bounds: Some([b[0], b[1], b[2], b[3]]),
        })
        .collect();

    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    detections.truncate(FACE_MAX_DETECTIONS);
    detections
}

/// Find the models directory
///
/// The configured directory wins; otherwise `models/` next to the
/// executable, up to three levels above it, and in the working directory.
pub fn find_model_dir(configured: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = configured {
        if dir.exists() {
            return Some(dir.to_path_buf());
        }
        log::warn!("Configured model directory {} does not exist", dir.display());
    }

    if let Ok(exe_path) = std::env::current_exe() {
        // target/debug or target/release puts the crate root two levels up
        for ancestor in exe_path.ancestors().skip(1).take(3) {
            let model_dir = ancestor.join("models");
            if model_dir.exists() {
                return Some(model_dir);
            }
        }
    }

    std::env::current_dir()
        .ok()
        .map(|cwd| cwd.join("models"))
        .filter(|dir| dir.exists())
}

/// Load every detector whose model is available.
///
/// Failures are logged and leave the slot empty.
pub fn load_detectors(models: &ModelSettings, confidence_threshold: f32) -> Detectors {
    let Some(model_dir) = find_model_dir(models.model_dir.as_deref()) else {
        log::warn!("Models directory not found. Detection disabled.");
        return Detectors::default();
    };
    log::info!("Model directory: {:?}", model_dir);

    let mut detectors = Detectors::default();

    match OnnxPoseKeypoints::load(&model_dir.join(&models.pose_model), confidence_threshold) {
        Ok(source) => {
            log::info!("Loaded pose model {}", models.pose_model);
            detectors.keypoints = Some(Arc::new(Mutex::new(source)));
        }
        Err(e) => log::warn!("Keypoint detection disabled: {}", e),
    }

    match OnnxSegmentation::load(&model_dir.join(&models.segmentation_model)) {
        Ok(source) => {
            log::info!("Loaded segmentation model {}", models.segmentation_model);
            detectors.segmentation = Some(Arc::new(Mutex::new(source)));
        }
        Err(e) => log::warn!("Segmentation disabled: {}", e),
    }

    match OnnxFacePresence::load(&model_dir.join(&models.face_model)) {
        Ok(source) => {
            log::info!("Loaded face model {}", models.face_model);
            detectors.presence = Some(Arc::new(Mutex::new(source)));
        }
        Err(e) => log::warn!("Presence detection disabled: {}", e),
    }

    detectors
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_faces_filters_and_sorts() {
        let scores = [0.9, 0.1, 0.2, 0.8, 0.5, 0.5, 0.7, 0.3];
        let boxes = [
            0.0, 0.0, 0.1, 0.1, //
            0.2, 0.2, 0.4, 0.4, //
            0.5, 0.5, 0.6, 0.6, //
            0.1, 0.1, 0.3, 0.3,
        ];
        let faces = decode_faces(&scores, &boxes);
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0].confidence, 0.8);
        assert_eq!(faces[0].bounds, Some([0.2, 0.2, 0.4, 0.4]));
        assert_eq!(faces[1].confidence, 0.5);
    }

    #[test]
    fn test_missing_model_is_reported() {
        let result = OnnxSegmentation::load(Path::new("/nonexistent/selfie.onnx"));
        assert!(matches!(result, Err(DetectorError::Model(_))));
    }

    #[test]
    fn test_configured_model_dir_must_exist() {
        let dir = std::env::temp_dir();
        assert_eq!(find_model_dir(Some(&dir)), Some(dir.clone()));
    }
}
