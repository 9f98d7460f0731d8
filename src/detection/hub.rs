//! Fire-and-forget detector dispatch
//!
//! Detector calls run off the frame thread (or inline, when configured).
//! Results come back over a channel tagged with the session that fired
//! them; the frame thread drains the channel once per tick and is the only
//! place cached signals change.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use super::{
    DetectorError, DetectorKind, KeypointSource, PresenceDetection, PresenceSource,
    SegmentationMask, SegmentationSource, ShoulderPair,
};
use crate::camera::{CameraFrame, FacingMode};

/// Result payload of one detector call
#[derive(Debug, Clone)]
pub enum DetectorOutput {
    Keypoints(Option<ShoulderPair>),
    Presence(Vec<PresenceDetection>),
    Segmentation(SegmentationMask),
}

/// A completed detector call
#[derive(Debug)]
pub struct DetectorEvent {
    pub session: u64,
    pub kind: DetectorKind,
    pub result: Result<DetectorOutput, DetectorError>,
}

/// Where detector calls execute
#[derive(Clone)]
pub enum Dispatch {
    /// Tokio blocking pool; the frame tick never waits on inference
    Runtime(tokio::runtime::Handle),
    /// Synchronously on the calling thread; results are still consumed on
    /// the following tick
    Inline,
}

/// The configured detector sources. Any of them may be absent.
#[derive(Default, Clone)]
pub struct Detectors {
    pub keypoints: Option<Arc<Mutex<dyn KeypointSource>>>,
    pub presence: Option<Arc<Mutex<dyn PresenceSource>>>,
    pub segmentation: Option<Arc<Mutex<dyn SegmentationSource>>>,
}

type Job = Box<dyn FnOnce() -> Result<DetectorOutput, DetectorError> + Send>;

/// Dispatches detector calls and collects their results
pub struct DetectorHub {
    detectors: Detectors,
    dispatch: Dispatch,
    sender: Sender<DetectorEvent>,
    receiver: Receiver<DetectorEvent>,
}

impl DetectorHub {
    pub fn new(detectors: Detectors, dispatch: Dispatch) -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self {
            detectors,
            dispatch,
            sender,
            receiver,
        }
    }

    /// Whether a source is configured for `kind`
    pub fn has(&self, kind: DetectorKind) -> bool {
        match kind {
            DetectorKind::Keypoints => self.detectors.keypoints.is_some(),
            DetectorKind::Presence => self.detectors.presence.is_some(),
            DetectorKind::Segmentation => self.detectors.segmentation.is_some(),
        }
    }

    fn job(&self, kind: DetectorKind, frame: Arc<CameraFrame>, facing: FacingMode) -> Option<Job> {
        let job: Job = match kind {
            DetectorKind::Keypoints => {
                let source = self.detectors.keypoints.clone()?;
                Box::new(move || {
                    source
                        .lock()
                        .estimate(&frame)
                        .map(DetectorOutput::Keypoints)
                })
            }
            DetectorKind::Presence => {
                let source = self.detectors.presence.clone()?;
                Box::new(move || {
                    source
                        .lock()
                        .estimate(&frame)
                        .map(DetectorOutput::Presence)
                })
            }
            DetectorKind::Segmentation => {
                let source = self.detectors.segmentation.clone()?;
                Box::new(move || {
                    source
                        .lock()
                        .segment(&frame, facing)
                        .map(DetectorOutput::Segmentation)
                })
            }
        };
        Some(job)
    }

    /// Start a detector call without waiting for it.
    ///
    /// Returns false when no source is configured for `kind`.
    pub fn fire(
        &self,
        kind: DetectorKind,
        session: u64,
        frame: Arc<CameraFrame>,
        facing: FacingMode,
    ) -> bool {
        let Some(job) = self.job(kind, frame, facing) else {
            return false;
        };
        let sender = self.sender.clone();
        let run = move || {
            let result = job();
            // The receiver lives as long as the hub; a closed channel only
            // means the pipeline shut down
            let _ = sender.send(DetectorEvent {
                session,
                kind,
                result,
            });
        };

        match &self.dispatch {
            Dispatch::Runtime(handle) => {
                handle.spawn_blocking(run);
            }
            Dispatch::Inline => run(),
        }
        true
    }

    /// All results delivered since the last drain
    pub fn drain(&self) -> Vec<DetectorEvent> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::Keypoint;
    use std::time::Instant;

    struct FixedKeypoints;

    impl KeypointSource for FixedKeypoints {
        fn estimate(&mut self, _frame: &CameraFrame) -> Result<Option<ShoulderPair>, DetectorError> {
            Ok(ShoulderPair::from_keypoints(
                Keypoint::new(100.0, 200.0, 0.9),
                Keypoint::new(300.0, 200.0, 0.9),
                0.4,
            ))
        }
    }

    struct FailingSegmentation;

    impl SegmentationSource for FailingSegmentation {
        fn segment(
            &mut self,
            _frame: &CameraFrame,
            _facing: FacingMode,
        ) -> Result<SegmentationMask, DetectorError> {
            Err(DetectorError::Inference("boom".to_string()))
        }
    }

    fn frame() -> Arc<CameraFrame> {
        Arc::new(CameraFrame {
            data: vec![0; 16],
            width: 2,
            height: 2,
            frame_number: 1,
            timestamp: Instant::now(),
        })
    }

    #[test]
    fn test_inline_dispatch_delivers_events() {
        let detectors = Detectors {
            keypoints: Some(Arc::new(Mutex::new(FixedKeypoints))),
            presence: None,
            segmentation: Some(Arc::new(Mutex::new(FailingSegmentation))),
        };
        let hub = DetectorHub::new(detectors, Dispatch::Inline);

        assert!(hub.has(DetectorKind::Keypoints));
        assert!(!hub.has(DetectorKind::Presence));
        assert!(!hub.fire(DetectorKind::Presence, 7, frame(), FacingMode::Rear));
        assert!(hub.fire(DetectorKind::Keypoints, 7, frame(), FacingMode::Rear));
        assert!(hub.fire(DetectorKind::Segmentation, 7, frame(), FacingMode::Rear));

        let events = hub.drain();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| e.session == 7));
        assert!(matches!(
            events[0].result,
            Ok(DetectorOutput::Keypoints(Some(_)))
        ));
        assert!(events[1].result.is_err());
        assert!(hub.drain().is_empty());
    }

    #[test]
    fn test_runtime_dispatch_delivers_events() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .build()
            .unwrap();
        let detectors = Detectors {
            keypoints: Some(Arc::new(Mutex::new(FixedKeypoints))),
            ..Default::default()
        };
        let hub = DetectorHub::new(detectors, Dispatch::Runtime(runtime.handle().clone()));
        assert!(hub.fire(DetectorKind::Keypoints, 1, frame(), FacingMode::Front));

        let event = hub
            .receiver
            .recv_timeout(std::time::Duration::from_secs(5))
            .unwrap();
        assert_eq!(event.kind, DetectorKind::Keypoints);
    }
}
