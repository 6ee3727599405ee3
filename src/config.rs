//! Configuration System using Figment
//!
//! Strongly-typed configuration for a scan session. Configuration is loaded from:
//! 1. `config/scan.toml` (base configuration)
//! 2. Environment variables prefixed with `SCAN_DAQ_`, nested keys separated by `__`
//!
//! Every section carries defaults, so an empty file yields a usable simulated setup.
//! The values are read once when a controller is built and passed by value from there.
//!
//! # Example
//! ```no_run
//! use scan_daq::config::AppConfig;
//!
//! let config = AppConfig::load()?;
//! config.validate()?;
//! println!("Camera: {}", config.camera.name);
//! # Ok::<(), scan_daq::error::DaqError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppResult, DaqError};
use crate::grid::GridSpec;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/scan.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "SCAN_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Scan grid parameters
    pub grid: GridSpec,
    /// Camera selection and acquisition parameters
    pub camera: CameraConfig,
    /// Stage selection
    pub positioner: PositionerConfig,
    /// Capture polling policy
    pub capture: CaptureConfig,
    /// Dataset output
    pub storage: StorageConfig,
    /// Illumination / wavelength metadata
    pub illumination: IlluminationConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "scan_daq".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Registered camera name
    pub name: String,
    /// Exposure time in milliseconds
    pub exposure_ms: f64,
    /// Binning factor (1, 2 or 4)
    pub binning: u32,
    /// Sensor width of the simulated camera
    pub sensor_width: u32,
    /// Sensor height of the simulated camera
    pub sensor_height: u32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            name: "cam1".to_string(),
            exposure_ms: 10.0,
            binning: 1,
            sensor_width: 256,
            sensor_height: 256,
        }
    }
}

/// Positioner configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PositionerConfig {
    /// Registered positioner name
    pub name: String,
    /// Encoder resolution of the simulated stage (mm)
    pub resolution_mm: Option<f64>,
    /// Fixed offset recorded in the run metadata (mm)
    pub offset_mm: [f64; 2],
}

impl Default for PositionerConfig {
    fn default() -> Self {
        Self {
            name: "pos1".to_string(),
            resolution_mm: None,
            offset_mm: [0.0, 0.0],
        }
    }
}

/// Capture polling policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Give up waiting for a frame after this long
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Give up after this many empty polls (unbounded when absent)
    pub max_polls: Option<u32>,
    /// Upper bound for the sleep between polls
    #[serde(with = "humantime_serde")]
    pub max_poll_interval: Duration,
    /// Frames averaged into one stored frame
    pub average_frames: u32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_polls: None,
            max_poll_interval: Duration::from_millis(10),
            average_frames: 1,
        }
    }
}

/// Dataset output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory receiving one dataset per measurement
    pub output_dir: PathBuf,
    /// Dataset name stem; the measurement number is appended as `_m<N>`
    pub file_stem: String,
    /// Capacity of the sequencer event channel
    pub event_channel_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            file_stem: "ptychodata".to_string(),
            event_channel_capacity: 16,
        }
    }
}

/// One AOTF channel of the light source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AotfChannel {
    /// Channel number
    pub channel: u32,
    /// Wavelength the channel is tuned to (nm)
    pub wavelength_nm: f64,
}

/// Illumination metadata configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IlluminationConfig {
    /// Wavelength reference: "550", "550 nm", "0.55 um" or "channel 2"
    pub wavelength: String,
    /// Value recorded when the reference cannot be resolved
    pub fallback_wavelength_nm: f64,
    /// AOTF channel table used by "channel N" references
    pub aotf_channels: Vec<AotfChannel>,
}

impl Default for IlluminationConfig {
    fn default() -> Self {
        Self {
            wavelength: "550".to_string(),
            fallback_wavelength_nm: 1.0,
            aotf_channels: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `config/scan.toml` and environment variables
    ///
    /// Example override: `SCAN_DAQ_CAMERA__EXPOSURE_MS=25`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment values apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Self::figment(path.as_ref()).extract()?;
        Ok(config)
    }

    /// Provider chain used by [`load_from`](Self::load_from).
    #[must_use]
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        self.grid.validate()?;

        if self.camera.name.trim().is_empty() {
            return Err(DaqError::Configuration("camera.name must not be empty".into()));
        }
        if !(self.camera.exposure_ms.is_finite() && self.camera.exposure_ms > 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid camera.exposure_ms {}. Must be positive",
                self.camera.exposure_ms
            )));
        }
        if !matches!(self.camera.binning, 1 | 2 | 4) {
            return Err(DaqError::Configuration(format!(
                "Invalid camera.binning {}. Must be 1, 2 or 4",
                self.camera.binning
            )));
        }
        if self.positioner.name.trim().is_empty() {
            return Err(DaqError::Configuration(
                "positioner.name must not be empty".into(),
            ));
        }

        if self.capture.timeout.is_zero() {
            return Err(DaqError::Configuration(
                "capture.timeout must be greater than zero".into(),
            ));
        }
        if self.capture.max_polls == Some(0) {
            return Err(DaqError::Configuration(
                "capture.max_polls must be at least 1".into(),
            ));
        }
        if self.capture.average_frames == 0 {
            return Err(DaqError::Configuration(
                "capture.average_frames must be at least 1".into(),
            ));
        }

        if self.storage.file_stem.trim().is_empty() {
            return Err(DaqError::Configuration(
                "storage.file_stem must not be empty".into(),
            ));
        }
        if self.storage.event_channel_capacity == 0 {
            return Err(DaqError::Configuration(
                "storage.event_channel_capacity must be at least 1".into(),
            ));
        }

        let mut channels = std::collections::HashSet::new();
        for entry in &self.illumination.aotf_channels {
            if !channels.insert(entry.channel) {
                return Err(DaqError::Configuration(format!(
                    "Duplicate AOTF channel: {}",
                    entry.channel
                )));
            }
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| DaqError::Configuration(e.to_string()))
    }
}
