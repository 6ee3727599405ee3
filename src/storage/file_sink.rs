//! Directory-per-measurement dataset sink.
//!
//! Layout of one dataset:
//!
//! ```text
//! ptychodata_m1/
//! ├── metadata.json     merged add_metadata calls
//! ├── layout.json       schema, reserved and recorded step counts
//! ├── steps.csv         one row per stored frame
//! └── camera.raw        little-endian u16 frames, back to back
//! ```
//!
//! Raw streams are preallocated to `total_steps` frames at prepare time and
//! trimmed to the recorded steps by `finish`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{DatasetSink, FrameSchema, FrameSet, MetadataMap, SinkOpener, SinkSummary};
use crate::error::{AppResult, DaqError};
use crate::hardware::FrameDescriptor;

const METADATA_FILE: &str = "metadata.json";
const LAYOUT_FILE: &str = "layout.json";
const STEPS_FILE: &str = "steps.csv";

/// Opens [`FileDatasetSink`]s on the local filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileSinkOpener;

impl SinkOpener for FileSinkOpener {
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn open(&self, path: &Path) -> AppResult<Box<dyn DatasetSink>> {
        Ok(Box::new(FileDatasetSink::create(path)?))
    }
}

/// One row of `steps.csv`.
#[derive(Debug, Serialize)]
struct StepRecord<'a> {
    step: usize,
    stream: &'a str,
    offset_bytes: u64,
    width: u32,
    height: u32,
    captured_at: DateTime<Utc>,
}

/// Contents of `layout.json`.
#[derive(Debug, Serialize)]
struct Layout<'a> {
    schema: &'a FrameSchema,
    pixel_type: &'static str,
    byte_order: &'static str,
    reserved_steps: usize,
    recorded_steps: usize,
    finished: bool,
}

struct RawStream {
    descriptor: FrameDescriptor,
    file: File,
}

/// File-backed dataset sink.
pub struct FileDatasetSink {
    path: PathBuf,
    metadata: MetadataMap,
    schema: FrameSchema,
    streams: BTreeMap<String, RawStream>,
    steps: Option<csv::Writer<File>>,
    reserved: usize,
    recorded: usize,
    finished: bool,
}

impl FileDatasetSink {
    /// Create the dataset directory.
    ///
    /// # Errors
    /// Fails when `path` already exists, so an earlier measurement is never
    /// overwritten.
    pub fn create(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            return Err(DaqError::Storage(format!(
                "Dataset '{}' already exists",
                path.display()
            )));
        }
        fs::create_dir_all(&path)?;
        info!(path = %path.display(), "Dataset created");

        Ok(Self {
            path,
            metadata: MetadataMap::new(),
            schema: FrameSchema::new(),
            streams: BTreeMap::new(),
            steps: None,
            reserved: 0,
            recorded: 0,
            finished: false,
        })
    }

    /// Dataset directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Location of the raw stream `name`.
    pub fn raw_path(&self, name: &str) -> PathBuf {
        self.path.join(format!("{name}.raw"))
    }

    fn ensure_open(&self) -> AppResult<()> {
        if self.finished {
            return Err(DaqError::Storage(format!(
                "Dataset '{}' is already finished",
                self.path.display()
            )));
        }
        Ok(())
    }

    fn write_layout(&self) -> AppResult<()> {
        let layout = Layout {
            schema: &self.schema,
            pixel_type: "u16",
            byte_order: "little",
            reserved_steps: self.reserved,
            recorded_steps: self.recorded,
            finished: self.finished,
        };
        let json = serde_json::to_string_pretty(&layout)?;
        fs::write(self.path.join(LAYOUT_FILE), json)?;
        Ok(())
    }
}

#[async_trait]
impl DatasetSink for FileDatasetSink {
    async fn add_metadata(&mut self, metadata: MetadataMap) -> AppResult<()> {
        self.ensure_open()?;
        self.metadata.extend(metadata);
        let json = serde_json::to_string_pretty(&self.metadata)?;
        fs::write(self.path.join(METADATA_FILE), json)?;
        Ok(())
    }

    async fn prepare_measurement(
        &mut self,
        schema: &FrameSchema,
        total_steps: usize,
    ) -> AppResult<()> {
        self.ensure_open()?;
        if self.steps.is_some() {
            return Err(DaqError::Storage(
                "prepare_measurement called twice".to_string(),
            ));
        }

        for (name, descriptor) in schema {
            let file = OpenOptions::new()
                .create_new(true)
                .read(true)
                .write(true)
                .open(self.raw_path(name))?;
            file.set_len(descriptor.frame_bytes() * total_steps as u64)?;
            self.streams.insert(
                name.clone(),
                RawStream {
                    descriptor: *descriptor,
                    file,
                },
            );
        }

        self.steps = Some(csv::Writer::from_path(self.path.join(STEPS_FILE))?);
        self.schema = schema.clone();
        self.reserved = total_steps;
        self.write_layout()?;
        debug!(streams = schema.len(), total_steps, "Dataset storage reserved");
        Ok(())
    }

    async fn add_measurement(&mut self, frames: FrameSet) -> AppResult<()> {
        self.ensure_open()?;
        let Some(steps) = self.steps.as_mut() else {
            return Err(DaqError::Storage(
                "add_measurement before prepare_measurement".to_string(),
            ));
        };
        if self.recorded >= self.reserved {
            return Err(DaqError::Storage(format!(
                "Dataset full: {} of {} steps recorded",
                self.recorded, self.reserved
            )));
        }
        if !frames.keys().eq(self.streams.keys()) {
            return Err(DaqError::Storage(format!(
                "Frame set {:?} does not match schema {:?}",
                frames.keys().collect::<Vec<_>>(),
                self.streams.keys().collect::<Vec<_>>()
            )));
        }
        for (name, frame) in &frames {
            let descriptor = self.streams[name].descriptor;
            if !descriptor.matches(frame) {
                return Err(DaqError::Storage(format!(
                    "Frame '{name}' has shape {:?}, dataset expects {}x{}",
                    frame.shape(),
                    descriptor.width,
                    descriptor.height
                )));
            }
        }

        for (name, frame) in &frames {
            let stream = self
                .streams
                .get_mut(name)
                .ok_or_else(|| DaqError::Storage(format!("Unknown stream '{name}'")))?;
            let offset = stream.descriptor.frame_bytes() * self.recorded as u64;
            stream.file.seek(SeekFrom::Start(offset))?;
            stream.file.write_all(&frame.to_le_bytes())?;

            steps.serialize(StepRecord {
                step: self.recorded,
                stream: name,
                offset_bytes: offset,
                width: frame.width(),
                height: frame.height(),
                captured_at: frame.captured_at(),
            })?;
        }
        steps.flush()?;
        self.recorded += 1;
        Ok(())
    }

    async fn finish(&mut self) -> AppResult<SinkSummary> {
        if !self.finished {
            for stream in self.streams.values_mut() {
                stream
                    .file
                    .set_len(stream.descriptor.frame_bytes() * self.recorded as u64)?;
                stream.file.sync_all()?;
            }
            if let Some(mut steps) = self.steps.take() {
                steps.flush()?;
            }
            self.finished = true;
            self.write_layout()?;
            info!(
                path = %self.path.display(),
                recorded = self.recorded,
                reserved = self.reserved,
                "Dataset finished"
            );
        }

        Ok(SinkSummary {
            path: self.path.clone(),
            reserved_steps: self.reserved,
            recorded_steps: self.recorded,
        })
    }
}
