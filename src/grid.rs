//! Scan grid generation.
//!
//! A [`GridSpec`] turns a handful of declarative parameters (probe size,
//! overlap between neighbouring probe footprints, maximum number of points and
//! an optional extent) into the ordered list of stage targets a scan visits.
//! The list is produced once per measurement configuration and is read-only
//! while a run is in progress.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Sub;

use crate::error::{AppResult, DaqError};

/// Largest accepted `n_points_max`.
pub const MAX_POINTS: u32 = 599;

/// A 2D point in stage-relative millimetres.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Coordinate {
    /// X position (mm)
    pub x: f64,
    /// Y position (mm)
    pub y: f64,
}

impl Coordinate {
    /// Stage origin.
    pub const ORIGIN: Coordinate = Coordinate { x: 0.0, y: 0.0 };

    /// Create a coordinate.
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to `other`.
    #[must_use]
    pub fn distance(&self, other: &Coordinate) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl Sub for Coordinate {
    type Output = Coordinate;

    fn sub(self, rhs: Coordinate) -> Coordinate {
        Coordinate::new(self.x - rhs.x, self.y - rhs.y)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.x, self.y)
    }
}

/// Declarative description of a square raster scan.
///
/// When `points` is set the raster parameters are ignored and the explicit list
/// is used verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    /// Diameter of the probe footprint (mm)
    #[serde(default = "default_probe_size")]
    pub probe_size_mm: f64,
    /// Fractional overlap of neighbouring footprints, `0 <= overlap < 1`
    #[serde(default = "default_overlap")]
    pub overlap: f64,
    /// Upper bound on the number of scan points (1..=599)
    #[serde(default = "default_n_points")]
    pub n_points_max: u32,
    /// Side length of the scanned square (mm); `None` sizes the grid from `n_points_max` alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extent_mm: Option<f64>,
    /// Precomputed coordinates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<Vec<Coordinate>>,
}

fn default_probe_size() -> f64 {
    60.0
}

fn default_overlap() -> f64 {
    0.85
}

fn default_n_points() -> u32 {
    10
}

impl Default for GridSpec {
    fn default() -> Self {
        Self {
            probe_size_mm: default_probe_size(),
            overlap: default_overlap(),
            n_points_max: default_n_points(),
            extent_mm: None,
            points: None,
        }
    }
}

impl GridSpec {
    /// Raster grid with the given probe size, overlap and point budget.
    #[must_use]
    pub fn raster(probe_size_mm: f64, overlap: f64, n_points_max: u32) -> Self {
        Self {
            probe_size_mm,
            overlap,
            n_points_max,
            extent_mm: None,
            points: None,
        }
    }

    /// Limit the raster to a square of side `extent_mm`.
    #[must_use]
    pub fn with_extent(mut self, extent_mm: f64) -> Self {
        self.extent_mm = Some(extent_mm);
        self
    }

    /// Wrap an already computed coordinate list.
    #[must_use]
    pub fn explicit(points: Vec<Coordinate>) -> Self {
        Self {
            points: Some(points),
            ..Self::default()
        }
    }

    /// Distance between neighbouring raster points (mm).
    #[must_use]
    pub fn step_mm(&self) -> f64 {
        self.probe_size_mm * (1.0 - self.overlap)
    }

    /// Points per raster row (and number of rows).
    #[must_use]
    pub fn side(&self) -> usize {
        let mut side = (f64::from(self.n_points_max).sqrt().floor() as usize).max(1);
        if let Some(extent) = self.extent_mm {
            let step = self.step_mm();
            if step > 0.0 {
                let fits = (extent / step).floor() as usize + 1;
                side = side.min(fits.max(1));
            }
        }
        side
    }

    /// Check every raster parameter against its declared range.
    pub fn validate(&self) -> AppResult<()> {
        if let Some(points) = &self.points {
            if let Some(bad) = points.iter().find(|c| !c.x.is_finite() || !c.y.is_finite()) {
                return Err(DaqError::Configuration(format!(
                    "grid.points contains a non-finite coordinate {bad}"
                )));
            }
            return Ok(());
        }

        if !(self.probe_size_mm.is_finite() && self.probe_size_mm > 0.0) {
            return Err(DaqError::Configuration(format!(
                "grid.probe_size_mm must be positive, got {}",
                self.probe_size_mm
            )));
        }
        if !(0.0..1.0).contains(&self.overlap) {
            return Err(DaqError::Configuration(format!(
                "grid.overlap must be in [0, 1), got {}",
                self.overlap
            )));
        }
        if !(1..=MAX_POINTS).contains(&self.n_points_max) {
            return Err(DaqError::Configuration(format!(
                "grid.n_points_max must be in 1..={MAX_POINTS}, got {}",
                self.n_points_max
            )));
        }
        if let Some(extent) = self.extent_mm {
            if !(extent.is_finite() && extent >= 0.0) {
                return Err(DaqError::Configuration(format!(
                    "grid.extent_mm must be non-negative, got {extent}"
                )));
            }
        }
        Ok(())
    }

    /// Produce the ordered coordinate list.
    ///
    /// Raster order is row by row, starting at `(0, 0)` and increasing `x`
    /// within a row.
    pub fn prepare(&self) -> AppResult<Vec<Coordinate>> {
        self.validate()?;
        if let Some(points) = &self.points {
            return Ok(points.clone());
        }

        let side = self.side();
        let step = self.step_mm();
        let coordinates = (0..side)
            .flat_map(|row| {
                (0..side).map(move |col| Coordinate::new(col as f64 * step, row as f64 * step))
            })
            .collect();
        Ok(coordinates)
    }
}
