//! Configuration loading using Figment
//!
//! Configuration is layered:
//! 1. Built-in defaults
//! 2. A TOML file (by default `config/fishface.toml`, optional)
//! 3. Environment variables prefixed with `FISHFACE_`, nested keys separated
//!    by a double underscore (`FISHFACE_CONTROLLER__STAGING_LEAD=5s`)
//!
//! Durations use humantime notation (`200ms`, `15s`).
//!
//! # Example
//! ```no_run
//! use fishface::config::FishFaceConfig;
//!
//! let config = FishFaceConfig::load()?;
//! config.validate()?;
//! println!("controller tick: {:?}", config.controller.tick);
//! # Ok::<(), fishface::error::CaptureError>(())
//! ```

use crate::error::{AppResult, CaptureError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/fishface.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FishFaceConfig {
    /// Logging settings
    pub logging: LoggingConfig,
    /// Capture job timing
    pub jobs: JobsConfig,
    /// Controller loop settings
    pub controller: ControllerConfig,
    /// Camera actor and device settings
    pub camera: CameraConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level (trace, debug, info, warn, error); `RUST_LOG` wins
    pub level: String,
    /// Output format (pretty, compact, json)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "compact".to_string(),
        }
    }
}

/// Timing of capture jobs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    /// Heartbeat interval of job actors
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// How far ahead of its timestamp a capture request is handed to the camera
    #[serde(with = "humantime_serde")]
    pub camera_preload: Duration,
    /// The job record must be confirmed this long before the first capture
    #[serde(with = "humantime_serde")]
    pub record_margin: Duration,
    /// Upper bound on the wait for the job record
    #[serde(with = "humantime_serde")]
    pub record_timeout: Duration,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            camera_preload: Duration::from_secs(15),
            record_margin: Duration::from_secs(1),
            record_timeout: Duration::from_secs(30),
        }
    }
}

/// Experiment capture controller settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Controller loop interval
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// The next job is staged once the current one ends within this lead
    #[serde(with = "humantime_serde")]
    pub staging_lead: Duration,
    /// A fresh controller gives up if no queue arrives within this window
    #[serde(with = "humantime_serde")]
    pub startup_window: Duration,
    /// How long the service waits for a fresh controller to become ready
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            staging_lead: Duration::from_secs(10),
            startup_window: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(5),
        }
    }
}

/// Camera actor and device configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture thread loop interval
    #[serde(with = "humantime_serde")]
    pub tick: Duration,
    /// A request is armed once its timestamp is within this many ticks
    pub lead_ticks: u32,
    /// The capture thread retires after this long without work
    #[serde(with = "humantime_serde")]
    pub idle_grace: Duration,
    /// How long the camera service waits for a new capture thread
    #[serde(with = "humantime_serde")]
    pub ready_timeout: Duration,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Image rotation in degrees (0, 90, 180, 270)
    pub rotation: u32,
}

impl CameraConfig {
    /// Lead window within which a request is armed.
    pub fn lead_window(&self) -> Duration {
        self.tick * self.lead_ticks
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            lead_ticks: 3,
            idle_grace: Duration::from_secs(3),
            ready_timeout: Duration::from_secs(6),
            width: 512,
            height: 384,
            rotation: 180,
        }
    }
}

impl FishFaceConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path. A missing file leaves
    /// the defaults in place.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FISHFACE_").split("__"))
            .extract()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(CaptureError::Configuration(format!(
                "Invalid logging.level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(CaptureError::Configuration(format!(
                "Invalid logging.format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            )));
        }

        for (name, tick) in [
            ("jobs.tick", self.jobs.tick),
            ("controller.tick", self.controller.tick),
            ("camera.tick", self.camera.tick),
        ] {
            if tick.is_zero() {
                return Err(CaptureError::Configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }

        if self.jobs.record_margin >= self.jobs.camera_preload {
            return Err(CaptureError::Configuration(format!(
                "jobs.record_margin ({:?}) must be shorter than jobs.camera_preload ({:?})",
                self.jobs.record_margin, self.jobs.camera_preload
            )));
        }

        if self.camera.lead_ticks == 0 {
            return Err(CaptureError::Configuration(
                "camera.lead_ticks must be at least 1".to_string(),
            ));
        }

        if ![0, 90, 180, 270].contains(&self.camera.rotation) {
            return Err(CaptureError::Configuration(format!(
                "Invalid camera.rotation {}. Must be 0, 90, 180 or 270",
                self.camera.rotation
            )));
        }

        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(CaptureError::Configuration(
                "camera resolution must be non-zero".to_string(),
            ));
        }

        Ok(())
    }
}
