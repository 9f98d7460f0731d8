//! Logging configuration and initialization
//!
//! Library modules log through the `log` facade; this installs a tracing
//! subscriber that receives both `log` records and tracing events.

use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "WING_OVERLAY_LOG";
/// Environment variable selecting the output format ("json")
pub const LOG_FORMAT_ENV: &str = "WING_OVERLAY_LOG_FORMAT";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Enable console output (default: true)
    pub console_enabled: bool,
    /// Optional log file; console output is kept alongside it
    pub file_path: Option<PathBuf>,
    /// Use JSON format for console logs (default: false)
    pub json_format: bool,
    /// Default log level filter (default: "info")
    pub default_level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enabled: true,
            file_path: None,
            json_format: false,
            default_level: "info".to_string(),
        }
    }
}

impl LogConfig {
    /// Resolve the filter directive: `WING_OVERLAY_LOG`, then `RUST_LOG`, then the default
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_env("RUST_LOG"))
            .unwrap_or_else(|_| EnvFilter::new(&self.default_level))
    }

    /// Whether JSON output is requested, from the environment or the config
    pub fn use_json(&self) -> bool {
        std::env::var(LOG_FORMAT_ENV)
            .map(|v| v.eq_ignore_ascii_case("json"))
            .unwrap_or(self.json_format)
    }
}

/// Initialize the logging system with the given configuration
///
/// Returns a guard that must be kept alive for the duration of the program
/// so file logging is flushed.
pub fn init_logging(
    config: &LogConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let use_json = config.use_json();
    let subscriber = tracing_subscriber::registry().with(config.env_filter());
    let mut file_guard = None;

    match (&config.file_path, config.console_enabled) {
        (Some(path), console) => {
            let file = std::fs::File::create(path)?;
            let (non_blocking, guard) = tracing_appender::non_blocking(file);
            file_guard = Some(guard);

            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false);

            if console {
                subscriber
                    .with(file_layer)
                    .with(fmt::layer().with_target(true).compact())
                    .try_init()?;
            } else {
                subscriber.with(file_layer).try_init()?;
            }
        }
        (None, true) if use_json => {
            let json_layer = fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true);
            subscriber.with(json_layer).try_init()?;
        }
        (None, true) => {
            subscriber
                .with(fmt::layer().with_target(true).compact())
                .try_init()?;
        }
        (None, false) => subscriber.try_init()?,
    }

    tracing::info!(
        target: "wing_overlay",
        version = env!("CARGO_PKG_VERSION"),
        json_format = use_json,
        file = ?config.file_path,
        "Logging initialized"
    );

    Ok(file_guard)
}

// Callers store this to keep file logging alive
pub use tracing_appender::non_blocking::WorkerGuard as LogGuard;
