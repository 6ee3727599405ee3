//! Dataset sinks.
//!
//! A measurement is stored as a dataset that is sized up front
//! (`prepare_measurement`) and then grows by one frame set per completed step
//! (`add_measurement`). Steps already written stay intact when a run ends early;
//! `finish` only trims the unused reservation.
//!
//! Two sinks are provided:
//! - [`FileDatasetSink`]: one directory per measurement with raw frame streams,
//!   a CSV step index and JSON metadata
//! - [`MemorySink`]: in-memory datasets for tests and dry runs

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::error::AppResult;
use crate::hardware::{Frame, FrameDescriptor};

pub mod file_sink;
pub mod memory;

pub use file_sink::{FileDatasetSink, FileSinkOpener};
pub use memory::{MemoryDataset, MemorySink, MemoryStore};

/// Frame streams of a dataset by name.
pub type FrameSchema = BTreeMap<String, FrameDescriptor>;

/// Frames of one step by stream name.
pub type FrameSet = BTreeMap<String, Frame>;

/// Free-form metadata object.
pub type MetadataMap = serde_json::Map<String, serde_json::Value>;

/// State of a dataset when its sink was finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SinkSummary {
    /// Dataset location
    pub path: PathBuf,
    /// Steps reserved by `prepare_measurement`
    pub reserved_steps: usize,
    /// Steps actually written
    pub recorded_steps: usize,
}

/// Storage collaborator receiving captured frames.
///
/// Call order: `add_metadata` (any number of times, keys merge), one
/// `prepare_measurement`, any number of `add_measurement`, one `finish`.
#[async_trait]
pub trait DatasetSink: Send {
    /// Merge `metadata` into the dataset attributes.
    async fn add_metadata(&mut self, metadata: MetadataMap) -> AppResult<()>;

    /// Reserve room for `total_steps` frame sets shaped like `schema`.
    async fn prepare_measurement(&mut self, schema: &FrameSchema, total_steps: usize)
        -> AppResult<()>;

    /// Append one frame set; its keys must equal the prepared schema.
    async fn add_measurement(&mut self, frames: FrameSet) -> AppResult<()>;

    /// Flush and close, keeping every step written so far.
    async fn finish(&mut self) -> AppResult<SinkSummary>;
}

/// Creates sinks for dataset paths.
pub trait SinkOpener: Send + Sync {
    /// Whether a dataset already exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Open a new sink at `path`, refusing to overwrite.
    fn open(&self, path: &Path) -> AppResult<Box<dyn DatasetSink>>;
}

/// Dataset path for measurement `number`: `<dir>/<stem>_m<number>`.
pub fn measurement_path(dir: &Path, stem: &str, number: u32) -> PathBuf {
    dir.join(format!("{stem}_m{number}"))
}
