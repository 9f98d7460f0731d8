//! Frame driver
//!
//! State machine: `Idle -> Starting -> Running -> (Restarting -> Starting) | Idle`.
//!
//! Every tick runs on the display thread: consume detector results that
//! arrived since the last tick, fire the detectors whose throttles are due,
//! then update visibility, the anchor and the scene from the cached
//! signals. Detector latency never blocks a tick.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::anchor::{AnchorSmoother, AnchorTransform, FrameGeometry};
use crate::assets::{AssetProvider, FileAssetSource, OverlayAsset};
use crate::camera::{
    open_with_fallback, wait_for_frame_size, CameraError, CameraFrame, CameraProvider,
    FacingMode, VideoSource,
};
use crate::detection::{
    DetectorHub, DetectorKind, DetectorOutput, DetectorThrottle, PresenceGate, ShoulderPair,
};
use crate::scene::SceneCompositor;
use crate::settings::OverlaySettings;

/// Pipeline lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverState {
    Idle,
    Starting,
    Running,
    Restarting,
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Camera(#[from] CameraError),
    #[error("Cannot {action} while {state:?}")]
    InvalidTransition {
        action: &'static str,
        state: DriverState,
    },
}

/// Outcome of one running tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub session: u64,
    pub visible: bool,
    pub presence: bool,
    pub has_pair: bool,
    pub anchor: AnchorTransform,
    /// Detectors fired this tick
    pub fired: Vec<DetectorKind>,
    pub mask_generation: u64,
}

/// Everything scoped to one camera session. Rebuilt on every start.
struct Session {
    id: u64,
    facing: FacingMode,
    frame_size: (u32, u32),
    camera: Box<dyn VideoSource>,
    smoother: AnchorSmoother,
    last_pair: Option<ShoulderPair>,
    presence: Option<bool>,
    keypoint_throttle: DetectorThrottle,
    presence_throttle: DetectorThrottle,
    segmentation_throttle: DetectorThrottle,
    scene: SceneCompositor,
}

impl Session {
    fn throttle_mut(&mut self, kind: DetectorKind) -> &mut DetectorThrottle {
        match kind {
            DetectorKind::Keypoints => &mut self.keypoint_throttle,
            DetectorKind::Presence => &mut self.presence_throttle,
            DetectorKind::Segmentation => &mut self.segmentation_throttle,
        }
    }
}

/// Orchestrates camera, detectors, anchor and scene
pub struct FrameDriver {
    settings: OverlaySettings,
    provider: Box<dyn CameraProvider>,
    hub: DetectorHub,
    runtime: tokio::runtime::Handle,
    state: DriverState,
    facing: FacingMode,
    viewport: (u32, u32),
    session: Option<Session>,
    next_session_id: u64,
    /// Resolved once; survives restarts
    asset: Option<OverlayAsset>,
    asset_loads: u32,
    presence_gate: PresenceGate,
}

impl FrameDriver {
    pub fn new(
        settings: OverlaySettings,
        provider: Box<dyn CameraProvider>,
        hub: DetectorHub,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        let facing = settings.camera.preferred_facing;
        let presence_gate = PresenceGate::new(settings.detection.presence_min_confidence);
        Self {
            settings,
            provider,
            hub,
            runtime,
            state: DriverState::Idle,
            facing,
            viewport: (1, 1),
            session: None,
            next_session_id: 1,
            asset: None,
            asset_loads: 0,
            presence_gate,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    /// Facing of the running session (or the one the next start will request)
    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.session.as_ref().map(|s| s.frame_size)
    }

    pub fn asset(&self) -> Option<&OverlayAsset> {
        self.asset.as_ref()
    }

    /// How many times the asset fallback chain ran
    pub fn asset_loads(&self) -> u32 {
        self.asset_loads
    }

    pub fn scene(&self) -> Option<&SceneCompositor> {
        self.session.as_ref().map(|s| &s.scene)
    }

    pub fn scene_mut(&mut self) -> Option<&mut SceneCompositor> {
        self.session.as_mut().map(|s| &mut s.scene)
    }

    pub fn latest_frame(&self) -> Option<Arc<CameraFrame>> {
        self.session.as_ref().and_then(|s| s.camera.latest_frame())
    }

    /// Acquire the camera and build a fresh session
    pub fn start(&mut self, viewport: (u32, u32)) -> Result<(), DriverError> {
        if !matches!(self.state, DriverState::Idle | DriverState::Restarting) {
            return Err(DriverError::InvalidTransition {
                action: "start",
                state: self.state,
            });
        }
        self.state = DriverState::Starting;
        self.viewport = viewport;
        log::info!("Driver starting ({} camera requested)", self.facing);

        let (camera, facing) = match open_with_fallback(self.provider.as_mut(), self.facing) {
            Ok(opened) => opened,
            Err(e) => {
                self.state = DriverState::Idle;
                return Err(e.into());
            }
        };
        self.facing = facing;

        let camera_settings = &self.settings.camera;
        let frame_size = wait_for_frame_size(
            camera.as_ref(),
            Duration::from_millis(camera_settings.metadata_timeout_ms),
            (camera_settings.fallback_width, camera_settings.fallback_height),
        );

        if self.asset.is_none() {
            let provider = AssetProvider::new(FileAssetSource, self.settings.assets.clone());
            self.asset = Some(self.runtime.block_on(provider.load_assets()));
            self.asset_loads += 1;
        } else if let Some(asset) = &self.asset {
            log::info!("Keeping {} asset tier", asset.tier());
        }

        let scene = SceneCompositor::new(
            &self.settings.scene,
            &self.settings.occlusion,
            self.settings.anchor.anchor_depth,
            facing,
            viewport,
        );

        let detection = &self.settings.detection;
        let id = self.next_session_id;
        self.next_session_id += 1;
        self.session = Some(Session {
            id,
            facing,
            frame_size,
            camera,
            smoother: AnchorSmoother::new(self.settings.anchor.clone()),
            last_pair: None,
            presence: None,
            keypoint_throttle: DetectorThrottle::new(detection.keypoint_interval),
            presence_throttle: DetectorThrottle::new(detection.presence_interval),
            segmentation_throttle: DetectorThrottle::new(detection.segmentation_interval),
            scene,
        });

        self.state = DriverState::Running;
        log::info!(
            "Driver running: session {}, {} camera, {}x{}",
            id,
            facing,
            frame_size.0,
            frame_size.1
        );
        Ok(())
    }

    fn teardown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.camera.stop();
            log::debug!("Session {} torn down", session.id);
        }
        if let Some(asset) = &mut self.asset {
            asset.set_visible(false);
        }
    }

    /// Restart with the other camera. Smoothing is cleared; the asset is kept.
    pub fn switch_camera(&mut self) -> Result<(), DriverError> {
        if self.state != DriverState::Running {
            return Err(DriverError::InvalidTransition {
                action: "switch camera",
                state: self.state,
            });
        }
        self.state = DriverState::Restarting;
        log::info!("Switching camera");
        self.teardown();
        self.facing = self.facing.toggled();
        self.start(self.viewport)
    }

    pub fn stop(&mut self) {
        self.teardown();
        if self.state != DriverState::Idle {
            log::info!("Driver stopped");
        }
        self.state = DriverState::Idle;
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        self.viewport = (width, height);
        if let Some(session) = &mut self.session {
            session.scene.resize(width, height);
        }
    }

    /// Advance one frame. Returns `None` unless running.
    pub fn tick(&mut self) -> Option<TickReport> {
        if self.state != DriverState::Running {
            return None;
        }
        let session = self.session.as_mut()?;

        for event in self.hub.drain() {
            if event.session != session.id {
                log::debug!(
                    "Discarding {:?} result from session {}",
                    event.kind,
                    event.session
                );
                continue;
            }
            session.throttle_mut(event.kind).complete();
            match event.result {
                Ok(DetectorOutput::Keypoints(Some(pair))) => session.last_pair = Some(pair),
                Ok(DetectorOutput::Keypoints(None)) => log::debug!("No shoulder pair this detection"),
                Ok(DetectorOutput::Presence(detections)) => {
                    session.presence = Some(self.presence_gate.evaluate(&detections));
                }
                Ok(DetectorOutput::Segmentation(mask)) => {
                    session.scene.occlusion_mut().update_mask(mask);
                }
                Err(e) => log::warn!("{:?} detector failed: {}", event.kind, e),
            }
        }

        let mut fired = Vec::new();
        if let Some(frame) = session.camera.latest_frame() {
            if (frame.width, frame.height) != session.frame_size {
                log::info!(
                    "Camera frame size changed: {}x{} -> {}x{}",
                    session.frame_size.0,
                    session.frame_size.1,
                    frame.width,
                    frame.height
                );
                session.frame_size = (frame.width, frame.height);
            }

            for kind in DetectorKind::ALL {
                if !self.hub.has(kind) {
                    continue;
                }
                if kind == DetectorKind::Segmentation && !session.scene.occlusion().is_enabled() {
                    continue;
                }
                if !session.throttle_mut(kind).poll() {
                    continue;
                }
                if self.hub.fire(kind, session.id, frame.clone(), session.facing) {
                    fired.push(kind);
                } else {
                    session.throttle_mut(kind).complete();
                }
            }
        }

        let presence = !self.settings.detection.require_presence
            || !self.hub.has(DetectorKind::Presence)
            || session.presence == Some(true);
        let visible = presence && session.last_pair.is_some();

        if let Some(pair) = &session.last_pair {
            let geometry = FrameGeometry {
                frame_width: session.frame_size.0,
                frame_height: session.frame_size.1,
                viewport_height: self.viewport.1 as f32,
            };
            session.smoother.update(pair, &geometry, session.facing);
        }
        let anchor = session.smoother.transform();

        if let Some(asset) = &mut self.asset {
            if asset.is_visible() != visible {
                log::debug!("Overlay visible: {}", visible);
            }
            asset.set_visible(visible);
            session
                .scene
                .update_overlay(&anchor, asset, &self.settings.anchor);
        }

        Some(TickReport {
            session: session.id,
            visible,
            presence,
            has_pair: session.last_pair.is_some(),
            anchor,
            fired,
            mask_generation: session.scene.occlusion().generation(),
        })
    }
}

impl Drop for FrameDriver {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::AssetTier;
    use crate::detection::{
        DetectorError, Detectors, Dispatch, Keypoint, KeypointSource, PresenceDetection,
        PresenceSource, SegmentationMask, SegmentationSource,
    };
    use glam::Vec3;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Instant;

    struct StaticSource(Arc<CameraFrame>);

    impl VideoSource for StaticSource {
        fn latest_frame(&self) -> Option<Arc<CameraFrame>> {
            Some(self.0.clone())
        }
        fn stop(&mut self) {}
    }

    /// Opens a 640x480 source for every facing not listed as missing
    struct ScriptedCamera {
        missing: Vec<FacingMode>,
        opened: Arc<Mutex<Vec<FacingMode>>>,
    }

    impl CameraProvider for ScriptedCamera {
        fn open(&mut self, facing: FacingMode) -> Result<Box<dyn VideoSource>, CameraError> {
            if self.missing.contains(&facing) {
                return Err(CameraError::Unavailable {
                    facing,
                    reason: "scripted".to_string(),
                });
            }
            self.opened.lock().push(facing);
            Ok(Box::new(StaticSource(Arc::new(CameraFrame {
                data: vec![0; 640 * 480 * 4],
                width: 640,
                height: 480,
                frame_number: 1,
                timestamp: Instant::now(),
            }))))
        }
    }

    /// Pops scripted results; an empty script means no person
    struct ScriptedKeypoints(VecDeque<Option<ShoulderPair>>);

    impl KeypointSource for ScriptedKeypoints {
        fn estimate(&mut self, _frame: &CameraFrame) -> Result<Option<ShoulderPair>, DetectorError> {
            Ok(self.0.pop_front().flatten())
        }
    }

    struct FixedPresence(f32);

    impl PresenceSource for FixedPresence {
        fn estimate(&mut self, _frame: &CameraFrame) -> Result<Vec<PresenceDetection>, DetectorError> {
            Ok(vec![PresenceDetection {
                confidence: self.0,
                bounds: None,
            }])
        }
    }

    struct FailingSegmentation;

    impl SegmentationSource for FailingSegmentation {
        fn segment(
            &mut self,
            _frame: &CameraFrame,
            _facing: FacingMode,
        ) -> Result<SegmentationMask, DetectorError> {
            Err(DetectorError::Inference("scripted".to_string()))
        }
    }

    struct FullMask;

    impl SegmentationSource for FullMask {
        fn segment(
            &mut self,
            _frame: &CameraFrame,
            _facing: FacingMode,
        ) -> Result<SegmentationMask, DetectorError> {
            Ok(SegmentationMask::new(vec![1.0; 4], 2, 2))
        }
    }

    fn shoulders() -> ShoulderPair {
        ShoulderPair {
            left: Keypoint::new(100.0, 200.0, 0.9),
            right: Keypoint::new(300.0, 200.0, 0.9),
        }
    }

    fn settings() -> OverlaySettings {
        let mut settings = OverlaySettings::default();
        settings.camera.preferred_facing = FacingMode::Rear;
        settings.camera.metadata_timeout_ms = 10;
        settings.detection.keypoint_interval = 1;
        settings.detection.presence_interval = 1;
        settings.detection.segmentation_interval = 1;
        settings.detection.inline = true;
        settings.assets.point_cloud_left = "/nonexistent/left.ksplat".into();
        settings.assets.point_cloud_right = "/nonexistent/right.ksplat".into();
        settings.assets.mesh_left = "/nonexistent/wing.obj".into();
        settings
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    struct Harness {
        driver: FrameDriver,
        opened: Arc<Mutex<Vec<FacingMode>>>,
        _runtime: tokio::runtime::Runtime,
    }

    fn harness(settings: OverlaySettings, detectors: Detectors, missing: Vec<FacingMode>) -> Harness {
        let runtime = runtime();
        let opened = Arc::new(Mutex::new(Vec::new()));
        let camera = ScriptedCamera {
            missing,
            opened: opened.clone(),
        };
        let hub = DetectorHub::new(detectors, Dispatch::Inline);
        let driver = FrameDriver::new(settings, Box::new(camera), hub, runtime.handle().clone());
        Harness {
            driver,
            opened,
            _runtime: runtime,
        }
    }

    fn detectors(script: Vec<Option<ShoulderPair>>, presence: f32) -> Detectors {
        Detectors {
            keypoints: Some(Arc::new(Mutex::new(ScriptedKeypoints(script.into())))),
            presence: Some(Arc::new(Mutex::new(FixedPresence(presence)))),
            segmentation: Some(Arc::new(Mutex::new(FailingSegmentation))),
        }
    }

    fn approx(a: Vec3, b: Vec3) -> bool {
        (a - b).abs().max_element() < 1e-4
    }

    #[test]
    fn test_first_smoothing_step_end_to_end() {
        let mut h = harness(settings(), detectors(vec![Some(shoulders())], 0.9), vec![]);
        h.driver.start((1280, 720)).unwrap();

        let first = h.driver.tick().unwrap();
        assert!(!first.visible);
        assert_eq!(
            first.fired,
            vec![
                DetectorKind::Keypoints,
                DetectorKind::Presence,
                DetectorKind::Segmentation
            ]
        );

        let second = h.driver.tick().unwrap();
        assert!(second.visible);
        assert!(approx(
            second.anchor.position,
            Vec3::new(-0.375, 1.0 / 6.0 - 0.5, -3.0) * 0.6
        ));
    }

    #[test]
    fn test_visibility_holds_across_missed_detection() {
        let script = vec![Some(shoulders()), None, None];
        let mut h = harness(settings(), detectors(script, 0.9), vec![]);
        h.driver.start((1280, 720)).unwrap();

        h.driver.tick();
        assert!(h.driver.tick().unwrap().visible);
        // The second detection found nobody
        let held = h.driver.tick().unwrap();
        assert!(held.visible);
        assert!(held.has_pair);
        assert!(h.driver.asset().unwrap().is_visible());
    }

    #[test]
    fn test_presence_gate_hides_overlay() {
        let mut h = harness(settings(), detectors(vec![Some(shoulders())], 0.3), vec![]);
        h.driver.start((1280, 720)).unwrap();
        h.driver.tick();
        let report = h.driver.tick().unwrap();
        assert!(report.has_pair);
        assert!(!report.presence);
        assert!(!report.visible);
    }

    #[test]
    fn test_presence_not_required_without_source() {
        let detectors = Detectors {
            keypoints: Some(Arc::new(Mutex::new(ScriptedKeypoints(
                vec![Some(shoulders())].into(),
            )))),
            ..Default::default()
        };
        let mut h = harness(settings(), detectors, vec![]);
        h.driver.start((1280, 720)).unwrap();
        h.driver.tick();
        assert!(h.driver.tick().unwrap().visible);
    }

    #[test]
    fn test_throttle_cadence() {
        let mut s = settings();
        s.detection.keypoint_interval = 2;
        s.detection.presence_interval = 10;
        s.detection.segmentation_interval = 3;
        let mut h = harness(s, detectors(vec![], 0.9), vec![]);
        h.driver.start((1280, 720)).unwrap();

        let mut keypoint_ticks = Vec::new();
        let mut segmentation_ticks = Vec::new();
        let mut presence_ticks = Vec::new();
        for tick in 0..12 {
            let report = h.driver.tick().unwrap();
            for kind in report.fired {
                match kind {
                    DetectorKind::Keypoints => keypoint_ticks.push(tick),
                    DetectorKind::Segmentation => segmentation_ticks.push(tick),
                    DetectorKind::Presence => presence_ticks.push(tick),
                }
            }
        }
        assert_eq!(keypoint_ticks, vec![0, 2, 4, 6, 8, 10]);
        assert_eq!(segmentation_ticks, vec![0, 3, 6, 9]);
        assert_eq!(presence_ticks, vec![0, 10]);
    }

    #[test]
    fn test_mask_reaches_occlusion() {
        let detectors = Detectors {
            segmentation: Some(Arc::new(Mutex::new(FullMask))),
            ..Default::default()
        };
        let mut h = harness(settings(), detectors, vec![]);
        h.driver.start((1280, 720)).unwrap();
        assert_eq!(h.driver.tick().unwrap().mask_generation, 0);
        assert_eq!(h.driver.tick().unwrap().mask_generation, 1);
        assert!(h.driver.scene().unwrap().occlusion().occludes(0.5, 0.5));
    }

    #[test]
    fn test_restart_clears_smoothing_and_keeps_asset() {
        let script = vec![Some(shoulders()), Some(shoulders()), Some(shoulders())];
        let mut h = harness(settings(), detectors(script, 0.9), vec![]);
        h.driver.start((1280, 720)).unwrap();
        assert_eq!(h.driver.asset().unwrap().tier(), AssetTier::Primitive);

        h.driver.tick();
        let before = h.driver.tick().unwrap();
        assert!(before.visible);
        let first_session = before.session;

        // A result from the old session is still queued
        h.driver.switch_camera().unwrap();
        assert_eq!(h.driver.state(), DriverState::Running);
        assert_eq!(h.driver.facing(), FacingMode::Front);

        let after = h.driver.tick().unwrap();
        assert_ne!(after.session, first_session);
        assert!(!after.visible);
        assert!(!after.has_pair);
        assert_eq!(after.anchor.position, Vec3::ZERO);

        assert_eq!(h.driver.asset_loads(), 1);
        assert_eq!(h.driver.asset().unwrap().tier(), AssetTier::Primitive);
        assert_eq!(*h.opened.lock(), vec![FacingMode::Rear, FacingMode::Front]);
    }

    #[test]
    fn test_camera_fallback_and_failure() {
        let mut s = settings();
        s.camera.preferred_facing = FacingMode::Front;
        let mut h = harness(s.clone(), Detectors::default(), vec![FacingMode::Front]);
        h.driver.start((1280, 720)).unwrap();
        assert_eq!(h.driver.facing(), FacingMode::Rear);

        let mut none = harness(s, Detectors::default(), vec![FacingMode::Front, FacingMode::Rear]);
        let result = none.driver.start((1280, 720));
        assert!(matches!(result, Err(DriverError::Camera(_))));
        assert_eq!(none.driver.state(), DriverState::Idle);
        assert!(none.driver.tick().is_none());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut h = harness(settings(), Detectors::default(), vec![]);
        assert!(matches!(
            h.driver.switch_camera(),
            Err(DriverError::InvalidTransition { .. })
        ));
        h.driver.start((1280, 720)).unwrap();
        assert!(matches!(
            h.driver.start((1280, 720)),
            Err(DriverError::InvalidTransition { .. })
        ));
        h.driver.stop();
        assert_eq!(h.driver.state(), DriverState::Idle);
        assert!(h.driver.session_id().is_none());
    }
}
