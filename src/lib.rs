//! # Scan DAQ Core Library
//!
//! Grid-scan acquisition: a stage visits a precomputed list of coordinates, a
//! camera frame is captured at every point, and each frame is appended to a
//! dataset while a presenter shows progress. Runs can be interrupted at any time
//! and finish cleanly at the next step boundary.
//!
//! ## Crate Structure
//!
//! - **`grid`**: `Coordinate` and the `GridSpec` raster generator.
//! - **`hardware`**: the `FrameSource` / `StagePositioner` capability traits, frames,
//!   simulated devices and the named `DeviceRegistry`.
//! - **`sequencer`**: the traversal state machine, capture-with-retry and the worker
//!   task that drives one run.
//! - **`storage`**: the `DatasetSink` trait with file-backed and in-memory sinks.
//! - **`session`**: dataset numbering (`<stem>_m<N>`) and the active sink.
//! - **`metadata`**: per-measurement metadata and wavelength resolution.
//! - **`presenter`**: live display collaborator.
//! - **`controller`**: glue wiring all of the above to one event loop.
//! - **`config`**, **`logging`**, **`error`**: figment configuration, tracing setup and
//!   the `DaqError` type.

pub mod config;
pub mod controller;
pub mod error;
pub mod grid;
pub mod hardware;
pub mod logging;
pub mod metadata;
pub mod presenter;
pub mod sequencer;
pub mod session;
pub mod storage;

pub use controller::{MeasurementReport, PreparedRun, ScanController};
pub use error::{AppResult, DaqError};
