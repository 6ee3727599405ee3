//! Scan controller.
//!
//! Thin glue between configuration, devices, the measurement session, the
//! presenter and the sequencer. The controller resolves its devices once at
//! construction; a missing device surfaces here as
//! [`DaqError::DeviceNotConfigured`] so callers can disable the feature instead
//! of failing mid-run.
//!
//! The event loop in [`ScanController::execute`] is what keeps the sequencer
//! honest: each `StepCompleted` is stored and displayed before `Proceed` is sent,
//! so the stage never runs ahead of storage.
//!
//! A [`PreparedRun`] holds the dataset open until it is executed or handed back
//! through [`ScanController::cancel`]. A run that was dropped instead is noticed
//! by the next `prepare_measurement`, which closes the stale dataset first.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::error::{AppResult, DaqError};
use crate::grid::{Coordinate, GridSpec};
use crate::hardware::{DeviceRegistry, FrameDescriptor, FrameSource, StagePositioner};
use crate::metadata::{resolve_wavelength, MeasurementMetadata, WavelengthResolution};
use crate::presenter::Presenter;
use crate::sequencer::{
    AcquisitionSequencer, CapturePolicy, RunSummary, SequencerEvent, SequencerHandle,
    SequencerRun,
};
use crate::session::{MeasurementSession, SessionReport};
use crate::storage::{FrameSchema, SinkOpener};

/// A measurement whose dataset is open and whose sequencer is ready to start.
pub struct PreparedRun {
    sequencer: AcquisitionSequencer,
    handle: SequencerHandle,
    dataset: PathBuf,
    ticket: Arc<()>,
}

impl PreparedRun {
    /// Handle for interrupting the run from another task.
    pub fn handle(&self) -> SequencerHandle {
        self.handle.clone()
    }

    /// Dataset the run records into.
    pub fn dataset(&self) -> &Path {
        &self.dataset
    }
}

/// Result of a measurement that reached `Finished`.
#[derive(Debug, Clone, Serialize)]
pub struct MeasurementReport {
    /// What the sequencer did
    pub summary: RunSummary,
    /// What was stored
    pub session: SessionReport,
}

/// Wires configuration, devices, storage and display to the sequencer.
pub struct ScanController {
    config: AppConfig,
    camera: Arc<dyn FrameSource>,
    positioner: Arc<dyn StagePositioner>,
    presenter: Arc<dyn Presenter>,
    session: MeasurementSession,
    coordinates: Vec<Coordinate>,
    pending: Option<Weak<()>>,
}

impl ScanController {
    /// Resolve devices, apply camera settings and build the coordinate list.
    ///
    /// # Errors
    /// - [`DaqError::Configuration`] when `config` fails validation
    /// - [`DaqError::DeviceNotConfigured`] when the camera or positioner is not registered
    /// - [`DaqError::Device`] when the camera rejects exposure or binning
    pub async fn new(
        config: AppConfig,
        registry: &DeviceRegistry,
        opener: Arc<dyn SinkOpener>,
        presenter: Arc<dyn Presenter>,
    ) -> AppResult<Self> {
        config.validate()?;

        let camera = registry.camera(&config.camera.name).map_err(|err| {
            error!(error = %err, "Scan controller disabled");
            err
        })?;
        let positioner = registry.positioner(&config.positioner.name).map_err(|err| {
            error!(error = %err, "Scan controller disabled");
            err
        })?;

        camera
            .set_parameter("exposure", serde_json::json!(config.camera.exposure_ms))
            .await
            .map_err(|e| DaqError::device(&config.camera.name, "set exposure", e))?;
        camera
            .set_parameter("binning", serde_json::json!(config.camera.binning))
            .await
            .map_err(|e| DaqError::device(&config.camera.name, "set binning", e))?;

        let coordinates = config.grid.prepare()?;
        presenter.show_path(&coordinates);

        let session = MeasurementSession::new(
            opener,
            config.storage.output_dir.clone(),
            config.storage.file_stem.clone(),
        );

        info!(
            camera = %config.camera.name,
            positioner = %config.positioner.name,
            points = coordinates.len(),
            "Scan controller ready"
        );
        Ok(Self {
            config,
            camera,
            positioner,
            presenter,
            session,
            coordinates,
            pending: None,
        })
    }

    /// Effective configuration.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Current coordinate list.
    pub fn coordinates(&self) -> &[Coordinate] {
        &self.coordinates
    }

    /// Measurement session (dataset numbering).
    pub fn session(&self) -> &MeasurementSession {
        &self.session
    }

    /// Replace the grid parameters and regenerate the coordinate list.
    ///
    /// # Errors
    /// [`DaqError::InvalidState`] while a measurement is being recorded.
    pub fn update_parameters(&mut self, grid: GridSpec) -> AppResult<()> {
        if self.session.is_active() && !self.run_abandoned() {
            return Err(DaqError::InvalidState(
                "Cannot change grid parameters during a measurement".to_string(),
            ));
        }
        let coordinates = grid.prepare()?;
        self.presenter.show_path(&coordinates);
        self.coordinates = coordinates;
        self.config.grid = grid;
        debug!(points = self.coordinates.len(), "Parameters updated");
        Ok(())
    }

    /// Open the next dataset and build a sequencer over the current coordinates.
    pub async fn prepare_measurement(&mut self) -> AppResult<PreparedRun> {
        if self.session.is_active() {
            if !self.run_abandoned() {
                return Err(DaqError::InvalidState(
                    "A measurement is already in progress".to_string(),
                ));
            }
            warn!("Prepared run was dropped before execution, closing its dataset");
            self.pending = None;
            self.session.abort("prepared run dropped").await?;
        }

        let (width, height) = self.camera.frame_shape();
        let schema = FrameSchema::from([(
            self.config.camera.name.clone(),
            FrameDescriptor::mono16(width, height),
        )]);

        let illumination = &self.config.illumination;
        let (wavelength_nm, resolved) =
            match resolve_wavelength(&illumination.wavelength, &illumination.aotf_channels) {
                WavelengthResolution::Resolved(nm) => (nm, true),
                WavelengthResolution::Unresolved { reference } => {
                    warn!(
                        reference = %reference,
                        fallback_nm = illumination.fallback_wavelength_nm,
                        "Could not resolve wavelength, recording fallback value"
                    );
                    (illumination.fallback_wavelength_nm, false)
                }
            };

        let metadata = MeasurementMetadata::builder(self.coordinates.clone())
            .camera(
                &self.config.camera.name,
                self.camera.exposure().as_secs_f64() * 1000.0,
                self.camera.binning(),
            )
            .positioner(&self.config.positioner.name, self.config.positioner.offset_mm)
            .wavelength(&illumination.wavelength, wavelength_nm, resolved)
            .grid(&self.config.grid)
            .build();

        let dataset = self
            .session
            .begin(&self.coordinates, metadata.to_map()?, &schema)
            .await?;

        let sequencer = AcquisitionSequencer::new(
            Arc::clone(&self.camera),
            Arc::clone(&self.positioner),
            self.coordinates.clone(),
        )
        .with_device_names(&self.config.camera.name, &self.config.positioner.name)
        .with_capture_policy(CapturePolicy::from_config(&self.config.capture))
        .with_channel_capacity(self.config.storage.event_channel_capacity);

        let ticket = Arc::new(());
        self.pending = Some(Arc::downgrade(&ticket));
        Ok(PreparedRun {
            handle: sequencer.handle(),
            sequencer,
            dataset,
            ticket,
        })
    }

    /// Close the dataset of a run that will not be executed.
    ///
    /// The sequencer never started, so no device was touched.
    pub async fn cancel(&mut self, run: PreparedRun) -> AppResult<SessionReport> {
        self.claim(&run)?;
        drop(run);
        self.session.abort("measurement cancelled").await
    }

    /// The open dataset belongs to a `PreparedRun` that no longer exists.
    fn run_abandoned(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|ticket| ticket.strong_count() == 0)
    }

    fn claim(&mut self, run: &PreparedRun) -> AppResult<()> {
        let owned = self.session.is_active()
            && self
                .pending
                .as_ref()
                .and_then(Weak::upgrade)
                .is_some_and(|ticket| Arc::ptr_eq(&ticket, &run.ticket));
        if !owned {
            return Err(DaqError::InvalidState(format!(
                "Run for '{}' is not the pending measurement",
                run.dataset.display()
            )));
        }
        self.pending = None;
        Ok(())
    }

    /// Start the sequencer and drive its event loop until the run is over.
    ///
    /// # Errors
    /// - [`DaqError::SequenceFailed`] when a device failed mid-run
    /// - sink errors when a step could not be stored; the sequencer is aborted first
    ///
    /// In both cases the dataset is closed with the steps recorded so far.
    pub async fn execute(&mut self, run: PreparedRun) -> AppResult<MeasurementReport> {
        self.claim(&run)?;
        let mut channels = match run.sequencer.start().await {
            Ok(channels) => channels,
            Err(err) => {
                self.session.abort(&err.to_string()).await?;
                return Err(err);
            }
        };
        let total = self.coordinates.len();
        let camera_name = self.config.camera.name.clone();

        while let Some(event) = channels.next_event().await {
            match event {
                SequencerEvent::StepCompleted(step) => {
                    if let Err(err) = self.session.record_step(&step, &camera_name).await {
                        error!(index = step.index, error = %err, "Failed to store step, aborting run");
                        return self.abort_run(channels, err).await;
                    }
                    self.presenter.show_frame(&camera_name, &step.frame);
                    self.presenter
                        .show_progress(step.position, Some(step.index), total);

                    if let Err(err) = channels.proceed().await {
                        return self.abort_run(channels, err).await;
                    }
                }
                SequencerEvent::Finished(summary) => {
                    self.presenter
                        .show_progress(summary.final_position, None, total);
                    let session = self.session.end().await?;
                    join_worker(channels).await;
                    return Ok(MeasurementReport { summary, session });
                }
                SequencerEvent::Failed(message) => {
                    self.session.abort(&message).await?;
                    join_worker(channels).await;
                    return Err(DaqError::SequenceFailed(message));
                }
            }
        }

        self.session.abort("sequencer stopped unexpectedly").await?;
        Err(DaqError::ChannelClosed)
    }

    /// Prepare and execute one measurement.
    pub async fn measure(&mut self) -> AppResult<MeasurementReport> {
        let run = self.prepare_measurement().await?;
        self.execute(run).await
    }

    async fn abort_run(
        &mut self,
        mut channels: SequencerRun,
        err: DaqError,
    ) -> AppResult<MeasurementReport> {
        if channels.abort().await.is_ok() {
            while let Some(event) = channels.next_event().await {
                if !matches!(event, SequencerEvent::StepCompleted(_)) {
                    break;
                }
            }
        }
        join_worker(channels).await;
        self.session.abort(&err.to_string()).await?;
        Err(err)
    }
}

async fn join_worker(channels: SequencerRun) {
    let SequencerRun { events, worker, .. } = channels;
    drop(events);
    if let Err(err) = worker.await {
        warn!(error = %err, "Sequencer worker did not shut down cleanly");
    }
}
