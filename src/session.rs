//! Measurement sessions.
//!
//! A [`MeasurementSession`] owns the dataset naming for one output directory and
//! the sink of the measurement currently being recorded. Datasets are named
//! `<stem>_m<N>`; `N` starts at 1 and increments whenever a measurement ends,
//! whether it completed or was aborted, so the next `begin` never overwrites an
//! earlier dataset. Numbers whose dataset already exists on disk are skipped.
//!
//! ## Lifecycle
//!
//! - **`begin`**: opens the sink, writes the metadata once, reserves storage for
//!   every coordinate
//! - **`record_step`**: appends one frame set per completed step, strictly in
//!   emission order
//! - **`end`** / **`abort`**: closes the sink, keeping the steps written so far

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{AppResult, DaqError};
use crate::grid::Coordinate;
use crate::sequencer::CapturedStep;
use crate::storage::{
    measurement_path, DatasetSink, FrameSchema, FrameSet, MetadataMap, SinkOpener,
};

/// Outcome of a closed measurement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionReport {
    /// Dataset location
    pub path: PathBuf,
    /// Measurement number used in the dataset name
    pub file_number: u32,
    /// Steps reserved at `begin`
    pub reserved_steps: usize,
    /// Steps recorded before the sink was closed
    pub recorded_steps: usize,
    /// Closed through `abort`
    pub aborted: bool,
}

struct ActiveMeasurement {
    sink: Box<dyn DatasetSink>,
    path: PathBuf,
    file_number: u32,
    reserved: usize,
    next_index: usize,
}

/// Dataset naming and the active sink for one output directory.
pub struct MeasurementSession {
    opener: Arc<dyn SinkOpener>,
    directory: PathBuf,
    stem: String,
    file_number: u32,
    active: Option<ActiveMeasurement>,
}

impl MeasurementSession {
    /// Session writing `<directory>/<stem>_m<N>` datasets, starting at `N = 1`.
    pub fn new(
        opener: Arc<dyn SinkOpener>,
        directory: impl Into<PathBuf>,
        stem: impl Into<String>,
    ) -> Self {
        Self {
            opener,
            directory: directory.into(),
            stem: stem.into(),
            file_number: 1,
            active: None,
        }
    }

    /// Number the next measurement will try first.
    pub fn file_number(&self) -> u32 {
        self.file_number
    }

    /// Whether a measurement is being recorded.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Dataset path of the active measurement.
    pub fn current_path(&self) -> Option<&Path> {
        self.active.as_ref().map(|active| active.path.as_path())
    }

    /// Steps recorded in the active measurement.
    pub fn recorded_steps(&self) -> usize {
        self.active.as_ref().map_or(0, |active| active.next_index)
    }

    /// Open the next dataset, write `metadata` and reserve one frame set per coordinate.
    ///
    /// # Errors
    /// [`DaqError::InvalidState`] while another measurement is active; sink errors otherwise.
    pub async fn begin(
        &mut self,
        coordinates: &[Coordinate],
        metadata: MetadataMap,
        schema: &FrameSchema,
    ) -> AppResult<PathBuf> {
        if let Some(active) = &self.active {
            return Err(DaqError::InvalidState(format!(
                "Measurement '{}' is still active",
                active.path.display()
            )));
        }

        let mut path = measurement_path(&self.directory, &self.stem, self.file_number);
        while self.opener.exists(&path) {
            warn!(path = %path.display(), "Dataset exists, trying next number");
            self.file_number += 1;
            path = measurement_path(&self.directory, &self.stem, self.file_number);
        }

        let mut sink = self.opener.open(&path)?;
        let prepared = async {
            sink.add_metadata(metadata).await?;
            sink.prepare_measurement(schema, coordinates.len()).await
        }
        .await;
        if let Err(err) = prepared {
            if let Err(finish_err) = sink.finish().await {
                warn!(error = %finish_err, "Failed to close dataset after prepare error");
            }
            self.file_number += 1;
            return Err(err);
        }

        info!(
            path = %path.display(),
            file_number = self.file_number,
            steps = coordinates.len(),
            "Measurement started"
        );
        self.active = Some(ActiveMeasurement {
            sink,
            path: path.clone(),
            file_number: self.file_number,
            reserved: coordinates.len(),
            next_index: 0,
        });
        Ok(path)
    }

    /// Append the frame of `step` under `camera_name`.
    ///
    /// # Errors
    /// [`DaqError::StepOutOfOrder`] unless `step.index` is the next expected index.
    pub async fn record_step(&mut self, step: &CapturedStep, camera_name: &str) -> AppResult<()> {
        let active = self
            .active
            .as_mut()
            .ok_or_else(|| DaqError::InvalidState("No active measurement".to_string()))?;
        if step.index != active.next_index {
            return Err(DaqError::StepOutOfOrder {
                expected: active.next_index,
                got: step.index,
            });
        }

        let frames = FrameSet::from([(camera_name.to_string(), step.frame.clone())]);
        active.sink.add_measurement(frames).await?;
        active.next_index += 1;
        Ok(())
    }

    /// Close the active measurement after a regular finish.
    pub async fn end(&mut self) -> AppResult<SessionReport> {
        let report = self.close(false).await?;
        info!(
            path = %report.path.display(),
            recorded = report.recorded_steps,
            reserved = report.reserved_steps,
            "Measurement finished"
        );
        Ok(report)
    }

    /// Close the active measurement after a failure, keeping the recorded steps.
    pub async fn abort(&mut self, reason: &str) -> AppResult<SessionReport> {
        let report = self.close(true).await?;
        warn!(
            path = %report.path.display(),
            recorded = report.recorded_steps,
            reserved = report.reserved_steps,
            reason,
            "Measurement aborted"
        );
        Ok(report)
    }

    async fn close(&mut self, aborted: bool) -> AppResult<SessionReport> {
        let mut active = self
            .active
            .take()
            .ok_or_else(|| DaqError::InvalidState("No active measurement".to_string()))?;
        self.file_number = active.file_number + 1;

        let summary = active.sink.finish().await?;
        Ok(SessionReport {
            path: active.path,
            file_number: active.file_number,
            reserved_steps: active.reserved,
            recorded_steps: summary.recorded_steps,
            aborted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{Frame, FrameDescriptor};
    use crate::storage::MemoryStore;

    fn schema() -> FrameSchema {
        FrameSchema::from([("cam1".to_string(), FrameDescriptor::mono16(1, 1))])
    }

    fn step(index: usize) -> CapturedStep {
        CapturedStep {
            index,
            target: Coordinate::ORIGIN,
            position: Coordinate::ORIGIN,
            frame: Frame::new(1, 1, vec![index as u16]).unwrap(),
            polls: 1,
        }
    }

    fn coords(n: usize) -> Vec<Coordinate> {
        vec![Coordinate::ORIGIN; n]
    }

    #[tokio::test]
    async fn test_numbering_increments_per_measurement() {
        let store = MemoryStore::new();
        let mut session = MeasurementSession::new(Arc::new(store.clone()), "out", "data");

        let first = session
            .begin(&coords(1), MetadataMap::new(), &schema())
            .await
            .unwrap();
        assert_eq!(first, PathBuf::from("out/data_m1"));
        session.record_step(&step(0), "cam1").await.unwrap();
        let report = session.end().await.unwrap();
        assert_eq!(report.file_number, 1);
        assert_eq!(report.recorded_steps, 1);

        let second = session
            .begin(&coords(1), MetadataMap::new(), &schema())
            .await
            .unwrap();
        assert_eq!(second, PathBuf::from("out/data_m2"));
        assert_eq!(store.dataset(&first).unwrap().measurements.len(), 1);
    }

    #[tokio::test]
    async fn test_existing_datasets_are_skipped() {
        let store = MemoryStore::new();
        store.occupy("out/data_m1");
        store.occupy("out/data_m2");
        let mut session = MeasurementSession::new(Arc::new(store), "out", "data");

        let path = session
            .begin(&coords(0), MetadataMap::new(), &schema())
            .await
            .unwrap();
        assert_eq!(path, PathBuf::from("out/data_m3"));
        assert_eq!(session.file_number(), 3);
    }

    #[tokio::test]
    async fn test_out_of_order_step_rejected() {
        let mut session =
            MeasurementSession::new(Arc::new(MemoryStore::new()), "out", "data");
        session
            .begin(&coords(3), MetadataMap::new(), &schema())
            .await
            .unwrap();

        session.record_step(&step(0), "cam1").await.unwrap();
        let err = session.record_step(&step(2), "cam1").await.unwrap_err();
        assert!(matches!(
            err,
            DaqError::StepOutOfOrder {
                expected: 1,
                got: 2
            }
        ));
        assert!(session.record_step(&step(0), "cam1").await.is_err());
        assert_eq!(session.recorded_steps(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_guards() {
        let mut session =
            MeasurementSession::new(Arc::new(MemoryStore::new()), "out", "data");
        assert!(matches!(session.end().await, Err(DaqError::InvalidState(_))));
        assert!(session.record_step(&step(0), "cam1").await.is_err());

        session
            .begin(&coords(1), MetadataMap::new(), &schema())
            .await
            .unwrap();
        assert!(matches!(
            session.begin(&coords(1), MetadataMap::new(), &schema()).await,
            Err(DaqError::InvalidState(_))
        ));

        let report = session.abort("test").await.unwrap();
        assert!(report.aborted);
        assert_eq!(report.recorded_steps, 0);
        assert_eq!(session.file_number(), 2);
        assert!(!session.is_active());
    }
}
