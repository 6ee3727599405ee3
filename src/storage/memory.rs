//! In-memory datasets.
//!
//! [`MemoryStore`] is a [`SinkOpener`] whose datasets live in a shared map, so a
//! test can keep a clone of the store and inspect what a controller wrote.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::{DatasetSink, FrameSchema, FrameSet, MetadataMap, SinkOpener, SinkSummary};
use crate::error::{AppResult, DaqError};

/// Snapshot of one in-memory dataset.
#[derive(Debug, Clone, Default)]
pub struct MemoryDataset {
    /// Merged metadata
    pub metadata: MetadataMap,
    /// Prepared schema
    pub schema: FrameSchema,
    /// Steps reserved at prepare time
    pub reserved_steps: usize,
    /// Recorded frame sets in order
    pub measurements: Vec<FrameSet>,
    /// `finish` was called
    pub finished: bool,
}

type Datasets = Arc<Mutex<BTreeMap<PathBuf, MemoryDataset>>>;

/// Shared store of in-memory datasets.
#[derive(Clone, Default)]
pub struct MemoryStore {
    datasets: Datasets,
    fail_on_measurement: Option<usize>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the `n`-th `add_measurement` (1-based, per dataset) fail.
    pub fn fail_on_measurement(mut self, n: usize) -> Self {
        self.fail_on_measurement = Some(n);
        self
    }

    /// Pretend a dataset already exists at `path`.
    pub fn occupy(&self, path: impl Into<PathBuf>) {
        self.datasets
            .lock()
            .insert(path.into(), MemoryDataset::default());
    }

    /// Snapshot of the dataset at `path`.
    pub fn dataset(&self, path: &Path) -> Option<MemoryDataset> {
        self.datasets.lock().get(path).cloned()
    }

    /// All dataset paths in order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.datasets.lock().keys().cloned().collect()
    }
}

impl SinkOpener for MemoryStore {
    fn exists(&self, path: &Path) -> bool {
        self.datasets.lock().contains_key(path)
    }

    fn open(&self, path: &Path) -> AppResult<Box<dyn DatasetSink>> {
        let mut datasets = self.datasets.lock();
        if datasets.contains_key(path) {
            return Err(DaqError::Storage(format!(
                "Dataset '{}' already exists",
                path.display()
            )));
        }
        datasets.insert(path.to_path_buf(), MemoryDataset::default());
        Ok(Box::new(MemorySink {
            path: path.to_path_buf(),
            datasets: Arc::clone(&self.datasets),
            fail_on_measurement: self.fail_on_measurement,
            prepared: false,
        }))
    }
}

/// Sink writing into a [`MemoryStore`].
pub struct MemorySink {
    path: PathBuf,
    datasets: Datasets,
    fail_on_measurement: Option<usize>,
    prepared: bool,
}

impl MemorySink {
    fn with_dataset<T>(&self, f: impl FnOnce(&mut MemoryDataset) -> AppResult<T>) -> AppResult<T> {
        let mut datasets = self.datasets.lock();
        let dataset = datasets.get_mut(&self.path).ok_or_else(|| {
            DaqError::Storage(format!("Dataset '{}' was removed", self.path.display()))
        })?;
        if dataset.finished {
            return Err(DaqError::Storage(format!(
                "Dataset '{}' is already finished",
                self.path.display()
            )));
        }
        f(dataset)
    }
}

#[async_trait]
impl DatasetSink for MemorySink {
    async fn add_metadata(&mut self, metadata: MetadataMap) -> AppResult<()> {
        self.with_dataset(|dataset| {
            dataset.metadata.extend(metadata);
            Ok(())
        })
    }

    async fn prepare_measurement(
        &mut self,
        schema: &FrameSchema,
        total_steps: usize,
    ) -> AppResult<()> {
        if self.prepared {
            return Err(DaqError::Storage(
                "prepare_measurement called twice".to_string(),
            ));
        }
        self.with_dataset(|dataset| {
            dataset.schema = schema.clone();
            dataset.reserved_steps = total_steps;
            dataset.measurements.reserve(total_steps);
            Ok(())
        })?;
        self.prepared = true;
        Ok(())
    }

    async fn add_measurement(&mut self, frames: FrameSet) -> AppResult<()> {
        if !self.prepared {
            return Err(DaqError::Storage(
                "add_measurement before prepare_measurement".to_string(),
            ));
        }
        let fail_on = self.fail_on_measurement;
        self.with_dataset(|dataset| {
            if fail_on == Some(dataset.measurements.len() + 1) {
                return Err(DaqError::Storage("injected write failure".to_string()));
            }
            if dataset.measurements.len() >= dataset.reserved_steps {
                return Err(DaqError::Storage(format!(
                    "Dataset full: {} steps reserved",
                    dataset.reserved_steps
                )));
            }
            if !frames.keys().eq(dataset.schema.keys()) {
                return Err(DaqError::Storage(
                    "Frame set does not match schema".to_string(),
                ));
            }
            dataset.measurements.push(frames);
            Ok(())
        })
    }

    async fn finish(&mut self) -> AppResult<SinkSummary> {
        let mut datasets = self.datasets.lock();
        let dataset = datasets.get_mut(&self.path).ok_or_else(|| {
            DaqError::Storage(format!("Dataset '{}' was removed", self.path.display()))
        })?;
        dataset.finished = true;
        Ok(SinkSummary {
            path: self.path.clone(),
            reserved_steps: dataset.reserved_steps,
            recorded_steps: dataset.measurements.len(),
        })
    }
}
