//! Camera capture module
//!
//! Provides cross-platform camera capture using the nokhwa crate. Frames are
//! captured on a background thread and the latest frame is handed to the
//! frame thread on request.

mod capture;

pub use capture::{CameraCapture, NokhwaCameraProvider};

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which physical camera is active. Drives horizontal mirroring everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Selfie camera, displayed mirrored
    #[default]
    Front,
    /// World-facing camera, displayed as captured
    Rear,
}

impl FacingMode {
    /// The other camera
    pub fn toggled(self) -> Self {
        match self {
            FacingMode::Front => FacingMode::Rear,
            FacingMode::Rear => FacingMode::Front,
        }
    }

    pub fn is_mirrored(self) -> bool {
        matches!(self, FacingMode::Front)
    }

    /// Mirror a value in [-1, 1] device space (negation when front-facing)
    pub fn mirror_ndc_x(self, x: f32) -> f32 {
        if self.is_mirrored() {
            -x
        } else {
            x
        }
    }

    /// Sign applied to quantities that flip with the mirror (tilt)
    pub fn mirror_sign(self) -> f32 {
        if self.is_mirrored() {
            -1.0
        } else {
            1.0
        }
    }
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacingMode::Front => write!(f, "front"),
            FacingMode::Rear => write!(f, "rear"),
        }
    }
}

/// Camera frame data
#[derive(Clone)]
pub struct CameraFrame {
    /// RGBA pixel data
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Frame number
    pub frame_number: u64,
    /// Frame timestamp
    pub timestamp: Instant,
}

impl CameraFrame {
    /// Aspect ratio (width / height)
    pub fn aspect(&self) -> f32 {
        self.width as f32 / self.height.max(1) as f32
    }

    /// Nearest-neighbour resample into a tightly packed buffer.
    ///
    /// `channels` is 3 for RGB output or 4 for RGBA.
    pub fn resample(&self, target_width: u32, target_height: u32, channels: usize) -> Vec<u8> {
        let mut output = vec![0u8; target_width as usize * target_height as usize * channels];
        let x_ratio = self.width as f32 / target_width as f32;
        let y_ratio = self.height as f32 / target_height as f32;

        for y in 0..target_height {
            for x in 0..target_width {
                let src_x = (x as f32 * x_ratio) as u32;
                let src_y = (y as f32 * y_ratio) as u32;
                let src_idx = ((src_y * self.width + src_x) * 4) as usize;
                let dst_idx = (y * target_width + x) as usize * channels;

                if src_idx + 3 < self.data.len() {
                    output[dst_idx..dst_idx + channels]
                        .copy_from_slice(&self.data[src_idx..src_idx + channels]);
                }
            }
        }

        output
    }
}

/// Errors opening or running a camera
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("No {facing} camera available: {reason}")]
    Unavailable { facing: FacingMode, reason: String },
    #[error("Failed to spawn capture thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// A running frame producer
pub trait VideoSource: Send {
    /// Latest captured frame, if any has arrived yet
    fn latest_frame(&self) -> Option<Arc<CameraFrame>>;

    /// Stop producing frames and release the device
    fn stop(&mut self);
}

/// Opens a video source for a facing mode
pub trait CameraProvider: Send {
    fn open(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>, CameraError>;
}

/// Open the requested facing, trying the alternate facing once on failure.
///
/// Returns the source and the facing actually opened.
pub fn open_with_fallback(
    provider: &mut dyn CameraProvider,
    facing: FacingMode,
) -> Result<(Box<dyn VideoSource>, FacingMode), CameraError> {
    match provider.open(facing) {
        Ok(source) => Ok((source, facing)),
        Err(first) => {
            let alternate = facing.toggled();
            log::warn!("{}. Trying {} camera", first, alternate);
            match provider.open(alternate) {
                Ok(source) => Ok((source, alternate)),
                Err(second) => {
                    log::error!("Camera unavailable: {}", second);
                    Err(CameraError::Unavailable {
                        facing,
                        reason: format!("{}; {}", first, second),
                    })
                }
            }
        }
    }
}

/// Wait up to `timeout` for the first frame and return its dimensions.
///
/// Falls back to `fallback` when no frame arrives in time instead of failing.
pub fn wait_for_frame_size(
    source: &dyn VideoSource,
    timeout: Duration,
    fallback: (u32, u32),
) -> (u32, u32) {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = source.latest_frame() {
            return (frame.width, frame.height);
        }
        if Instant::now() >= deadline {
            log::warn!(
                "No camera frame after {:?}, assuming {}x{}",
                timeout,
                fallback.0,
                fallback.1
            );
            return fallback;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticSource(Option<Arc<CameraFrame>>);

    impl VideoSource for StaticSource {
        fn latest_frame(&self) -> Option<Arc<CameraFrame>> {
            self.0.clone()
        }
        fn stop(&mut self) {}
    }

    struct RearOnly;

    impl CameraProvider for RearOnly {
        fn open(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>, CameraError> {
            match facing {
                FacingMode::Rear => Ok(Box::new(StaticSource(None))),
                FacingMode::Front => Err(CameraError::Unavailable {
                    facing,
                    reason: "not present".to_string(),
                }),
            }
        }
    }

    struct NoCamera;

    impl CameraProvider for NoCamera {
        fn open(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>, CameraError> {
            Err(CameraError::Unavailable {
                facing,
                reason: "not present".to_string(),
            })
        }
    }

    fn frame(width: u32, height: u32) -> CameraFrame {
        CameraFrame {
            data: vec![0; (width * height * 4) as usize],
            width,
            height,
            frame_number: 1,
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn test_mirroring_helpers() {
        assert_eq!(FacingMode::Front.mirror_ndc_x(0.25), -0.25);
        assert_eq!(FacingMode::Rear.mirror_ndc_x(0.25), 0.25);
        assert_eq!(FacingMode::Front.mirror_sign(), -1.0);
        assert!(!FacingMode::Rear.is_mirrored());
        assert_eq!(FacingMode::Front.toggled(), FacingMode::Rear);
    }

    #[test]
    fn test_fallback_to_alternate_facing() {
        let (_, facing) = open_with_fallback(&mut RearOnly, FacingMode::Front).unwrap();
        assert_eq!(facing, FacingMode::Rear);
    }

    #[test]
    fn test_no_camera_is_fatal() {
        let result = open_with_fallback(&mut NoCamera, FacingMode::Front);
        assert!(matches!(result, Err(CameraError::Unavailable { .. })));
    }

    #[test]
    fn test_wait_for_frame_size() {
        let source = StaticSource(Some(Arc::new(frame(320, 240))));
        assert_eq!(
            wait_for_frame_size(&source, Duration::from_millis(10), (640, 480)),
            (320, 240)
        );

        let empty = StaticSource(None);
        assert_eq!(
            wait_for_frame_size(&empty, Duration::from_millis(10), (640, 480)),
            (640, 480)
        );
    }

    #[test]
    fn test_resample_rgb() {
        let mut f = frame(2, 2);
        f.data = vec![
            10, 20, 30, 255, 40, 50, 60, 255, //
            70, 80, 90, 255, 100, 110, 120, 255,
        ];
        let rgb = f.resample(1, 1, 3);
        assert_eq!(rgb, vec![10, 20, 30]);
        let same = f.resample(2, 2, 4);
        assert_eq!(same, f.data);
    }
}
