//! Wing Overlay - shoulder-anchored overlay with depth-correct occlusion
//!
//! Captures a live camera feed, tracks the shoulders of a single person and
//! places a pair of wing models behind them. A person segmentation mask is
//! rendered as a depth-only surface so the person appears in front of the
//! wings.

pub mod anchor;
pub mod app;
pub mod assets;
pub mod camera;
pub mod detection;
pub mod driver;
pub mod occlusion;
pub mod render;
pub mod scene;
pub mod settings;
pub mod telemetry;

pub use app::App;
pub use driver::{DriverState, FrameDriver};
pub use settings::OverlaySettings;
