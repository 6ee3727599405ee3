//! Measurement metadata and wavelength resolution.
//!
//! Every dataset starts with one metadata object describing how it was taken:
//! the target coordinates, camera settings, stage offset, illumination
//! wavelength and grid parameters.
//!
//! Wavelength references come from user input and may be a bare number, a number
//! with a unit, or the name of an AOTF channel. [`resolve_wavelength`] never
//! guesses: it returns [`WavelengthResolution::Unresolved`] and leaves the choice
//! of a default to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::AotfChannel;
use crate::error::{AppResult, DaqError};
use crate::grid::{Coordinate, GridSpec};
use crate::storage::MetadataMap;

/// Outcome of resolving a wavelength reference.
#[derive(Debug, Clone, PartialEq)]
pub enum WavelengthResolution {
    /// Wavelength in nanometres
    Resolved(f64),
    /// No interpretation matched
    Unresolved {
        /// The reference as given
        reference: String,
    },
}

impl WavelengthResolution {
    /// Whether a value was found.
    pub fn is_resolved(&self) -> bool {
        matches!(self, WavelengthResolution::Resolved(_))
    }

    /// The resolved value or `fallback`.
    pub fn value_or(&self, fallback: f64) -> f64 {
        match self {
            WavelengthResolution::Resolved(nm) => *nm,
            WavelengthResolution::Unresolved { .. } => fallback,
        }
    }
}

/// Resolve a wavelength reference to nanometres.
///
/// Tried in order:
/// 1. a plain number, taken as nanometres (`"550"`)
/// 2. a number with a unit suffix: `nm`, `um` or `µm` (`"0.55 um"`)
/// 3. an AOTF channel lookup: `"channel 2"`, `"channel_2"` or `"ch2"`
pub fn resolve_wavelength(reference: &str, channels: &[AotfChannel]) -> WavelengthResolution {
    let text = reference.trim().to_lowercase();

    let resolved = parse_nanometres(&text)
        .or_else(|| parse_with_unit(&text))
        .or_else(|| parse_channel(&text, channels));

    match resolved {
        Some(nm) => WavelengthResolution::Resolved(nm),
        None => WavelengthResolution::Unresolved {
            reference: reference.to_string(),
        },
    }
}

fn positive(value: f64) -> Option<f64> {
    (value.is_finite() && value > 0.0).then_some(value)
}

fn parse_nanometres(text: &str) -> Option<f64> {
    text.parse::<f64>().ok().and_then(positive)
}

fn parse_with_unit(text: &str) -> Option<f64> {
    const UNITS: [(&str, f64); 4] = [("nm", 1.0), ("um", 1000.0), ("µm", 1000.0), ("μm", 1000.0)];
    UNITS.iter().find_map(|(suffix, scale)| {
        let number = text.strip_suffix(suffix)?.trim();
        parse_nanometres(number).map(|value| value * scale)
    })
}

fn parse_channel(text: &str, channels: &[AotfChannel]) -> Option<f64> {
    let rest = text
        .strip_prefix("channel")
        .or_else(|| text.strip_prefix("ch"))?;
    let number: u32 = rest.trim_start_matches(['_', ' ', '#']).parse().ok()?;
    channels
        .iter()
        .find(|entry| entry.channel == number)
        .and_then(|entry| positive(entry.wavelength_nm))
}

/// Metadata written once at the start of every measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementMetadata {
    /// Unique run identifier
    pub run_id: Uuid,
    /// Measurement start
    pub started_at: DateTime<Utc>,
    /// Planned stage targets, relative to the origin (mm)
    pub target_coordinates: Vec<Coordinate>,
    /// Camera exposure (ms)
    pub exposure_ms: f64,
    /// Camera binning factor
    pub binning: u32,
    /// Stage offset (mm)
    pub offset: [f64; 2],
    /// Illumination wavelength (nm)
    pub wavelength_nm: f64,
    /// `false` when `wavelength_nm` is the configured fallback
    pub wavelength_resolved: bool,
    /// Wavelength reference as configured
    pub wavelength_reference: String,
    /// Grid parameters the coordinates came from
    pub grid: GridSpec,
    /// Camera name
    pub camera: String,
    /// Positioner name
    pub positioner: String,
    /// Version of the acquisition software
    pub software_version: String,
}

impl MeasurementMetadata {
    /// Start building metadata for a run over `coordinates`.
    pub fn builder(coordinates: Vec<Coordinate>) -> MeasurementMetadataBuilder {
        MeasurementMetadataBuilder {
            inner: MeasurementMetadata {
                run_id: Uuid::new_v4(),
                started_at: Utc::now(),
                target_coordinates: coordinates,
                exposure_ms: 0.0,
                binning: 1,
                offset: [0.0, 0.0],
                wavelength_nm: 0.0,
                wavelength_resolved: false,
                wavelength_reference: String::new(),
                grid: GridSpec::default(),
                camera: String::new(),
                positioner: String::new(),
                software_version: env!("CARGO_PKG_VERSION").to_string(),
            },
        }
    }

    /// Metadata as a JSON object for [`DatasetSink::add_metadata`](crate::storage::DatasetSink::add_metadata).
    pub fn to_map(&self) -> AppResult<MetadataMap> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(map) => Ok(map),
            other => Err(DaqError::Storage(format!(
                "Metadata serialised to {other}, expected an object"
            ))),
        }
    }
}

/// A builder for [`MeasurementMetadata`].
pub struct MeasurementMetadataBuilder {
    inner: MeasurementMetadata,
}

impl MeasurementMetadataBuilder {
    /// Camera settings.
    pub fn camera(mut self, name: &str, exposure_ms: f64, binning: u32) -> Self {
        self.inner.camera = name.to_string();
        self.inner.exposure_ms = exposure_ms;
        self.inner.binning = binning;
        self
    }

    /// Positioner name and stage offset.
    pub fn positioner(mut self, name: &str, offset: [f64; 2]) -> Self {
        self.inner.positioner = name.to_string();
        self.inner.offset = offset;
        self
    }

    /// Illumination wavelength.
    pub fn wavelength(mut self, reference: &str, nm: f64, resolved: bool) -> Self {
        self.inner.wavelength_reference = reference.to_string();
        self.inner.wavelength_nm = nm;
        self.inner.wavelength_resolved = resolved;
        self
    }

    /// Grid parameters.
    pub fn grid(mut self, grid: &GridSpec) -> Self {
        self.inner.grid = grid.clone();
        self
    }

    /// Finish building.
    pub fn build(self) -> MeasurementMetadata {
        self.inner
    }
}
