//! Logging setup.
//!
//! Every actor logs through `tracing` with structured fields (`actor`,
//! `xp_id`, `cjr_id`, ...). This module installs the `tracing-subscriber`
//! formatter:
//! - pretty, compact or JSON output
//! - `RUST_LOG` filtering, falling back to the configured level
//! - idempotent initialisation, so tests and embedders may call it freely
//!
//! # Example
//! ```no_run
//! use fishface::{config::FishFaceConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FishFaceConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(xp_id = 3, "experiment started");
//! # Ok(())
//! # }
//! ```

use crate::config::FishFaceConfig;
use crate::error::{AppResult, CaptureError};
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, registry::Registry, util::SubscriberInitExt, EnvFilter, Layer,
};

/// Output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, coloured (development)
    Pretty,
    /// Single-line, no colours (services)
    Compact,
    /// One JSON object per event (log aggregation)
    Json,
}

impl FromStr for OutputFormat {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            other => Err(CaptureError::Configuration(format!(
                "Invalid log format '{other}'. Must be one of: pretty, compact, json"
            ))),
        }
    }
}

/// Logging options
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Default level when `RUST_LOG` is unset
    pub level: Level,
    /// Output format
    pub format: OutputFormat,
    /// Include file and line numbers
    pub with_file_and_line: bool,
    /// Include thread names
    pub with_thread_names: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_file_and_line: false,
            with_thread_names: false,
        }
    }
}

impl LoggingOptions {
    /// Options from the `[logging]` configuration section
    pub fn from_config(config: &FishFaceConfig) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&config.logging.level)?,
            format: config.logging.format.parse()?,
            ..Default::default()
        })
    }

    /// Set the output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }
}

/// Initialise logging from configuration
pub fn init_from_config(config: &FishFaceConfig) -> AppResult<()> {
    init(LoggingOptions::from_config(config)?)
}

/// Initialise logging. Returns Ok(()) if a global subscriber is already set.
pub fn init(options: LoggingOptions) -> AppResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(options.level.as_str().to_lowercase()));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match options.format {
        OutputFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(options.with_file_and_line)
            .with_line_number(options.with_file_and_line)
            .with_thread_names(options.with_thread_names)
            .boxed(),
        OutputFormat::Compact => fmt::layer()
            .compact()
            .with_ansi(false)
            .with_file(options.with_file_and_line)
            .with_line_number(options.with_file_and_line)
            .with_thread_names(options.with_thread_names)
            .boxed(),
        OutputFormat::Json => fmt::layer()
            .json()
            .with_file(options.with_file_and_line)
            .with_line_number(options.with_file_and_line)
            .with_thread_names(options.with_thread_names)
            .boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // already initialised elsewhere (tests, embedding applications)
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(CaptureError::Configuration(format!(
            "Failed to initialize logging: {e}"
        ))),
    }
}

fn parse_log_level(level: &str) -> AppResult<Level> {
    Level::from_str(level).map_err(|_| {
        CaptureError::Configuration(format!(
            "Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error"
        ))
    })
}
