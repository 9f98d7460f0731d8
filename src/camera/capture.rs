//! nokhwa-backed capture thread
//!
//! The device is opened on the capture thread; the open result is reported
//! back over a channel so callers can fall back to another camera.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use nokhwa::pixel_format::RgbAFormat;
use nokhwa::utils::{CameraIndex, RequestedFormat, RequestedFormatType, Resolution};
use nokhwa::Camera;
use parking_lot::Mutex;

use super::{CameraError, CameraFrame, CameraProvider, FacingMode, VideoSource};
use crate::settings::CameraSettings;

/// How long to wait for the device to report whether it opened
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);

type FrameSlots = [Arc<Mutex<Option<Arc<CameraFrame>>>>; 3];

/// Camera capture running on a background thread
pub struct CameraCapture {
    /// Latest captured frames - triple buffered
    frames: FrameSlots,
    /// Index of the latest complete frame
    latest_frame_idx: Arc<AtomicU64>,
    /// Whether capture is running
    running: Arc<AtomicBool>,
    /// Capture thread handle
    thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl CameraCapture {
    /// Open a camera by device index and start capturing.
    ///
    /// Blocks until the device reports that it opened (or failed to).
    pub fn open(
        camera_index: u32,
        facing: FacingMode,
        width: u32,
        height: u32,
    ) -> Result<Self, CameraError> {
        let frames: FrameSlots = [
            Arc::new(Mutex::new(None)),
            Arc::new(Mutex::new(None)),
            Arc::new(Mutex::new(None)),
        ];
        let latest_frame_idx = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));
        let (opened_tx, opened_rx) = crossbeam_channel::bounded::<Result<(), String>>(1);

        let frames_clone = frames.clone();
        let latest_frame_idx_clone = latest_frame_idx.clone();
        let running_clone = running.clone();

        let thread_handle = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                Self::capture_thread(
                    camera_index,
                    Resolution::new(width, height),
                    frames_clone,
                    latest_frame_idx_clone,
                    running_clone,
                    opened_tx,
                );
            })?;

        let mut capture = Self {
            frames,
            latest_frame_idx,
            running,
            thread_handle: Some(thread_handle),
        };

        let opened = opened_rx
            .recv_timeout(OPEN_TIMEOUT)
            .unwrap_or_else(|_| Err("device did not respond".to_string()));

        match opened {
            Ok(()) => Ok(capture),
            Err(reason) => {
                capture.stop();
                Err(CameraError::Unavailable { facing, reason })
            }
        }
    }

    fn open_device(camera_index: u32, resolution: Resolution) -> Result<Camera, String> {
        let index = CameraIndex::Index(camera_index);
        let attempts = [
            RequestedFormatType::HighestResolution(resolution),
            RequestedFormatType::AbsoluteHighestResolution,
            RequestedFormatType::None,
        ];

        let mut last_error = String::from("no formats attempted");
        for attempt in attempts {
            let requested = RequestedFormat::new::<RgbAFormat>(attempt);
            match Camera::new(index.clone(), requested) {
                Ok(mut camera) => match camera.open_stream() {
                    Ok(()) => return Ok(camera),
                    Err(e) => last_error = format!("failed to open stream: {:?}", e),
                },
                Err(e) => {
                    log::debug!("Camera {} rejected {:?}: {:?}", camera_index, attempt, e);
                    last_error = format!("{:?}", e);
                }
            }
        }
        Err(last_error)
    }

    fn capture_thread(
        camera_index: u32,
        resolution: Resolution,
        frames: FrameSlots,
        latest_frame_idx: Arc<AtomicU64>,
        running: Arc<AtomicBool>,
        opened: Sender<Result<(), String>>,
    ) {
        log::info!("Starting camera capture thread (camera {})", camera_index);

        let mut camera = match Self::open_device(camera_index, resolution) {
            Ok(camera) => camera,
            Err(e) => {
                running.store(false, Ordering::Release);
                let _ = opened.send(Err(e));
                return;
            }
        };

        log::info!(
            "Camera opened: {} ({}x{})",
            camera.info().human_name(),
            camera.resolution().width(),
            camera.resolution().height()
        );
        let _ = opened.send(Ok(()));

        let mut write_idx: u64 = 0;
        let mut frame_count: u64 = 0;

        while running.load(Ordering::Acquire) {
            match camera.frame() {
                Ok(frame) => match frame.decode_image::<RgbAFormat>() {
                    Ok(image) => {
                        frame_count += 1;
                        let camera_frame = CameraFrame {
                            data: image.into_raw(),
                            width: frame.resolution().width(),
                            height: frame.resolution().height(),
                            frame_number: frame_count,
                            timestamp: Instant::now(),
                        };

                        let slot = (write_idx % 3) as usize;
                        *frames[slot].lock() = Some(Arc::new(camera_frame));
                        latest_frame_idx.store(write_idx, Ordering::Release);
                        write_idx = write_idx.wrapping_add(1);
                    }
                    Err(e) => {
                        log::warn!("Failed to decode frame: {:?}", e);
                    }
                },
                Err(e) => {
                    log::warn!("Failed to capture frame: {:?}", e);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }

        if let Err(e) = camera.stop_stream() {
            log::debug!("Failed to stop camera stream: {:?}", e);
        }
        log::info!(
            "Camera capture thread stopped after {} frames",
            frame_count
        );
    }
}

impl VideoSource for CameraCapture {
    fn latest_frame(&self) -> Option<Arc<CameraFrame>> {
        let idx = self.latest_frame_idx.load(Ordering::Acquire);
        let slot = (idx % 3) as usize;
        self.frames[slot].lock().clone()
    }

    fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for CameraCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Maps facing modes onto native device indices.
///
/// Device names containing "front"/"back"/"rear" win over the configured
/// indices when the platform reports them.
pub struct NokhwaCameraProvider {
    settings: CameraSettings,
}

impl NokhwaCameraProvider {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }

    fn device_index(&self, facing: FacingMode) -> u32 {
        let configured = match facing {
            FacingMode::Front => self.settings.front_index,
            FacingMode::Rear => self.settings.rear_index,
        };

        let cameras = match nokhwa::query(nokhwa::utils::ApiBackend::Auto) {
            Ok(list) => list,
            Err(e) => {
                log::warn!("Failed to enumerate cameras: {:?}", e);
                return configured;
            }
        };

        let keywords: &[&str] = match facing {
            FacingMode::Front => &["front", "facetime", "user"],
            FacingMode::Rear => &["back", "rear", "environment"],
        };

        cameras
            .iter()
            .position(|info| {
                let name = info.human_name().to_lowercase();
                keywords.iter().any(|k| name.contains(k))
            })
            .map(|idx| idx as u32)
            .unwrap_or(configured)
    }
}

impl CameraProvider for NokhwaCameraProvider {
    fn open(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>, CameraError> {
        let index = self.device_index(facing);
        log::info!("Opening {} camera (device {})", facing, index);
        let capture = CameraCapture::open(
            index,
            facing,
            self.settings.request_width,
            self.settings.request_height,
        )?;
        Ok(Box::new(capture))
    }
}
