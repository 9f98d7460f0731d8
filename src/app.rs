//! Application state holding the wgpu graphics context
//!
//! Owns the device, surface and scene renderer, and drives the frame
//! driver once per redraw.

use std::sync::Arc;
use std::time::Instant;

use glam::Mat4;
use thiserror::Error;
use winit::dpi::PhysicalSize;
use winit::window::Window;

use crate::camera::NokhwaCameraProvider;
use crate::detection::onnx::load_detectors;
use crate::detection::{DetectorHub, Dispatch};
use crate::driver::{DriverError, FrameDriver};
use crate::render::SceneRenderer;
use crate::settings::OverlaySettings;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Failed to create surface: {0}")]
    Surface(#[from] wgpu::CreateSurfaceError),
    #[error("No suitable GPU adapter found")]
    NoAdapter,
    #[error("Failed to create device: {0}")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error(transparent)]
    Driver(#[from] DriverError),
}

/// Main application state
pub struct App {
    /// The wgpu surface for presenting rendered frames; holds its own window reference
    surface: wgpu::Surface<'static>,
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: wgpu::SurfaceConfiguration,
    /// Current window size in physical pixels
    size: PhysicalSize<u32>,

    renderer: SceneRenderer,
    driver: FrameDriver,
    /// Session whose video is on the GPU
    rendered_session: Option<u64>,
    asset_uploaded: bool,

    // Frame timing
    frame_count: u64,
    fps: f64,
    last_fps_update: Instant,
    frames_since_update: u64,
}

impl App {
    /// Create the graphics context and start the pipeline.
    ///
    /// Fails when no camera can be opened in either facing.
    pub async fn new(
        window: Arc<Window>,
        settings: OverlaySettings,
        runtime: tokio::runtime::Handle,
    ) -> Result<Self, AppError> {
        let size = window.inner_size();

        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let surface = instance.create_surface(window)?;

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: Some(&surface),
                force_fallback_adapter: false,
            })
            .await
            .ok_or(AppError::NoAdapter)?;

        log::info!("Using GPU: {}", adapter.get_info().name);
        log::info!("Backend: {:?}", adapter.get_info().backend);

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Wing Overlay Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: adapter.limits(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await?;

        let surface_caps = surface.get_capabilities(&adapter);
        let surface_format = surface_caps
            .formats
            .iter()
            .find(|f| f.is_srgb())
            .copied()
            .unwrap_or(surface_caps.formats[0]);
        log::info!("Surface format: {:?}", surface_format);

        let present_mode = if surface_caps
            .present_modes
            .contains(&wgpu::PresentMode::Mailbox)
        {
            wgpu::PresentMode::Mailbox
        } else {
            wgpu::PresentMode::Fifo
        };
        log::info!("Present mode: {:?}", present_mode);

        let config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format: surface_format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode,
            alpha_mode: surface_caps.alpha_modes[0],
            view_formats: vec![],
            desired_maximum_frame_latency: 1,
        };
        surface.configure(&device, &config);

        let renderer = SceneRenderer::new(&device, &queue, surface_format, config.width, config.height);

        let detectors = load_detectors(&settings.models, settings.anchor.confidence_threshold);
        let dispatch = if settings.detection.inline {
            Dispatch::Inline
        } else {
            Dispatch::Runtime(runtime.clone())
        };
        let hub = DetectorHub::new(detectors, dispatch);
        let provider = Box::new(NokhwaCameraProvider::new(settings.camera.clone()));
        let driver = FrameDriver::new(settings, provider, hub, runtime);

        let mut app = Self {
            surface,
            device,
            queue,
            config,
            size,
            renderer,
            driver,
            rendered_session: None,
            asset_uploaded: false,
            frame_count: 0,
            fps: 0.0,
            last_fps_update: Instant::now(),
            frames_since_update: 0,
        };
        app.driver.start((app.config.width, app.config.height))?;
        app.sync_asset();
        Ok(app)
    }

    /// The asset resolves on the first successful start
    fn sync_asset(&mut self) {
        if self.asset_uploaded {
            return;
        }
        if let Some(asset) = self.driver.asset() {
            self.renderer.upload_asset(&self.device, asset);
            self.asset_uploaded = true;
        }
    }

    pub fn resize(&mut self, new_size: PhysicalSize<u32>) {
        if new_size.width > 0 && new_size.height > 0 {
            self.size = new_size;
            self.config.width = new_size.width;
            self.config.height = new_size.height;
            self.surface.configure(&self.device, &self.config);
            self.renderer.resize(&self.device, new_size.width, new_size.height);
            self.driver.resize(new_size.width, new_size.height);
        }
    }

    pub fn size(&self) -> PhysicalSize<u32> {
        self.size
    }

    /// Restart the pipeline on the other camera.
    ///
    /// An error means neither camera could be reopened.
    pub fn switch_camera(&mut self) -> Result<(), DriverError> {
        match self.driver.switch_camera() {
            Err(DriverError::InvalidTransition { state, .. }) => {
                log::debug!("Ignoring camera switch while {:?}", state);
                Ok(())
            }
            result => result,
        }
    }

    /// Advance the pipeline one tick and upload what changed
    pub fn update(&mut self) {
        let Some(report) = self.driver.tick() else {
            return;
        };

        if self.rendered_session != Some(report.session) {
            self.renderer.reset_video();
            self.rendered_session = Some(report.session);
        }
        if let Some(frame) = self.driver.latest_frame() {
            self.renderer.upload_frame(&self.device, &self.queue, &frame);
        }
        if let Some(scene) = self.driver.scene_mut() {
            if let Some(upload) = scene.occlusion_mut().take_upload() {
                self.renderer.upload_mask(&self.device, &self.queue, upload);
            }
        }

        self.frame_count += 1;
        self.frames_since_update += 1;
        let elapsed = self.last_fps_update.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            self.fps = self.frames_since_update as f64 / elapsed;
            self.frames_since_update = 0;
            self.last_fps_update = Instant::now();
            log::debug!(
                "{:.1} fps, overlay visible: {}, frame {}",
                self.fps,
                report.visible,
                self.frame_count
            );
        }
    }

    pub fn render(&mut self) -> Result<(), wgpu::SurfaceError> {
        let output = self.surface.get_current_texture()?;
        let view = output
            .texture
            .create_view(&wgpu::TextureViewDescriptor::default());

        match (self.driver.scene(), self.driver.asset()) {
            (Some(scene), Some(asset)) => {
                let items = scene.draw_list(asset);
                self.renderer.render(
                    &self.device,
                    &self.queue,
                    &view,
                    scene.view_projection(),
                    &items,
                );
            }
            // No session: clear only
            _ => self
                .renderer
                .render(&self.device, &self.queue, &view, Mat4::IDENTITY, &[]),
        }

        output.present();
        Ok(())
    }

    /// Release the camera before the window goes away
    pub fn shutdown(&mut self) {
        self.driver.stop();
    }
}
