//! Scan controller end-to-end tests
//!
//! Wires configuration, mock devices, a dataset sink and a recording presenter
//! through `ScanController` and checks what ends up in storage and on screen.

use scan_daq::config::AppConfig;
use scan_daq::grid::{Coordinate, GridSpec};
use scan_daq::hardware::mock::{MockCamera, MockStage};
use scan_daq::hardware::{DeviceRegistry, Frame};
use scan_daq::presenter::{Presenter, PresenterCall, RecordingPresenter};
use scan_daq::sequencer::SequencerHandle;
use scan_daq::storage::{FileSinkOpener, MemoryStore};
use scan_daq::{DaqError, ScanController};
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};

fn config(output_dir: &Path, points: u32) -> AppConfig {
    let mut config = AppConfig::default();
    config.grid = GridSpec::raster(60.0, 0.85, points);
    config.camera.sensor_width = 8;
    config.camera.sensor_height = 8;
    config.storage.output_dir = output_dir.to_path_buf();
    config
}

struct Devices {
    registry: DeviceRegistry,
    camera: Arc<MockCamera>,
    stage: Arc<MockStage>,
}

fn devices(camera: MockCamera, stage: MockStage) -> Devices {
    let camera = Arc::new(camera);
    let stage = Arc::new(stage);
    let mut registry = DeviceRegistry::new();
    registry.register_camera("cam1", camera.clone()).unwrap();
    registry.register_positioner("pos1", stage.clone()).unwrap();
    Devices {
        registry,
        camera,
        stage,
    }
}

#[tokio::test]
async fn test_measurement_writes_dataset_and_updates_display() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), 4);
    let registry = DeviceRegistry::simulated(&config).unwrap();
    let presenter = Arc::new(RecordingPresenter::new());

    let mut controller = ScanController::new(
        config,
        &registry,
        Arc::new(FileSinkOpener),
        presenter.clone(),
    )
    .await
    .unwrap();
    assert_eq!(controller.coordinates().len(), 4);

    let report = controller.measure().await.unwrap();
    assert_eq!(report.summary.steps_completed, 4);
    assert!(!report.summary.interrupted);
    assert_eq!(report.session.path, dir.path().join("ptychodata_m1"));
    assert_eq!(report.session.recorded_steps, 4);
    assert!(!controller.session().is_active());

    // One frame per step, in step order, each stored before it was shown
    let raw = fs::metadata(report.session.path.join("cam1.raw")).unwrap();
    assert_eq!(raw.len(), 4 * 8 * 8 * 2);
    assert_eq!(presenter.steps_shown(), vec![0, 1, 2, 3]);

    let calls = presenter.calls();
    assert_eq!(calls.first(), Some(&PresenterCall::Path(4)));
    assert_eq!(
        calls[1],
        PresenterCall::Frame("cam1".to_string(), (8, 8))
    );
    assert_eq!(
        calls.last(),
        Some(&PresenterCall::Progress(Coordinate::ORIGIN, None, 4))
    );

    let metadata: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(report.session.path.join("metadata.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(metadata["camera"], "cam1");
    assert_eq!(metadata["wavelength_nm"], 550.0);
    assert_eq!(metadata["wavelength_resolved"], true);
    assert_eq!(metadata["target_coordinates"].as_array().unwrap().len(), 4);

    // A second measurement gets the next number
    let second = controller.measure().await.unwrap();
    assert_eq!(second.session.path, dir.path().join("ptychodata_m2"));
    assert!(report.session.path.join("cam1.raw").exists());
}

#[tokio::test]
async fn test_sink_failure_aborts_without_further_moves() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new().fail_on_measurement(2);
    let devices = devices(MockCamera::new(8, 8), MockStage::new());

    let mut controller = ScanController::new(
        config(dir.path(), 9),
        &devices.registry,
        Arc::new(store.clone()),
        Arc::new(RecordingPresenter::new()),
    )
    .await
    .unwrap();

    let err = controller.measure().await.unwrap_err();
    assert!(matches!(err, DaqError::Storage(_)), "{err}");
    assert!(!controller.session().is_active());

    let dataset = store
        .dataset(&dir.path().join("ptychodata_m1"))
        .expect("dataset must exist");
    assert!(dataset.finished);
    assert_eq!(dataset.reserved_steps, 9);
    assert_eq!(dataset.measurements.len(), 1);

    // Two steps were moved and captured; the abort issued no return move
    assert_eq!(devices.stage.moves().len(), 4);
    assert_eq!(devices.camera.frame_count(), 2);
    assert!(!devices.camera.is_acquiring());
}

#[tokio::test]
async fn test_device_failure_closes_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let devices = devices(MockCamera::new(8, 8), MockStage::new().fail_on_move(5));

    let mut controller = ScanController::new(
        config(dir.path(), 4),
        &devices.registry,
        Arc::new(store.clone()),
        Arc::new(RecordingPresenter::new()),
    )
    .await
    .unwrap();

    match controller.measure().await {
        Err(DaqError::SequenceFailed(message)) => assert!(message.contains("pos1"), "{message}"),
        other => panic!("expected SequenceFailed, got {other:?}"),
    }

    let dataset = store.dataset(&dir.path().join("ptychodata_m1")).unwrap();
    assert!(dataset.finished);
    assert_eq!(dataset.measurements.len(), 2);

    // The next measurement never reuses the failed dataset's number
    let report = controller.measure().await.unwrap();
    assert_eq!(report.session.path, dir.path().join("ptychodata_m2"));
}

#[tokio::test]
async fn test_missing_device_disables_controller() {
    let dir = tempfile::tempdir().unwrap();
    let registry = DeviceRegistry::simulated(&config(dir.path(), 4)).unwrap();

    let mut wanted = config(dir.path(), 4);
    wanted.positioner.name = "stage-b".to_string();

    let result = ScanController::new(
        wanted,
        &registry,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingPresenter::new()),
    )
    .await;

    match result {
        Err(DaqError::DeviceNotConfigured {
            role,
            name,
            available,
        }) => {
            assert_eq!(role, "positioner");
            assert_eq!(name, "stage-b");
            assert_eq!(available, vec!["pos1".to_string()]);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("controller must not start without its positioner"),
    }
}

#[tokio::test]
async fn test_update_parameters_regenerates_path() {
    let dir = tempfile::tempdir().unwrap();
    let registry = DeviceRegistry::simulated(&config(dir.path(), 4)).unwrap();
    let presenter = Arc::new(RecordingPresenter::new());
    let mut controller = ScanController::new(
        config(dir.path(), 4),
        &registry,
        Arc::new(MemoryStore::new()),
        presenter.clone(),
    )
    .await
    .unwrap();

    controller
        .update_parameters(GridSpec::raster(60.0, 0.5, 9))
        .unwrap();
    assert_eq!(controller.coordinates().len(), 9);
    assert_eq!(controller.config().grid.overlap, 0.5);
    assert_eq!(
        presenter.calls(),
        vec![PresenterCall::Path(4), PresenterCall::Path(9)]
    );

    assert!(controller
        .update_parameters(GridSpec::raster(60.0, 1.5, 9))
        .is_err());
    assert_eq!(controller.coordinates().len(), 9);

    // Not while a dataset is open
    let run = controller.prepare_measurement().await.unwrap();
    assert!(matches!(
        controller.update_parameters(GridSpec::raster(60.0, 0.5, 4)),
        Err(DaqError::InvalidState(_))
    ));
    controller.execute(run).await.unwrap();
    assert!(controller
        .update_parameters(GridSpec::raster(60.0, 0.5, 4))
        .is_ok());
}

/// Presenter that interrupts the run once the first step is displayed.
#[derive(Default)]
struct InterruptingPresenter {
    handle: OnceLock<SequencerHandle>,
}

impl Presenter for InterruptingPresenter {
    fn show_frame(&self, _name: &str, _frame: &Frame) {}

    fn show_progress(&self, _position: Coordinate, step: Option<usize>, _total: usize) {
        if step == Some(0) {
            if let Some(handle) = self.handle.get() {
                handle.interrupt();
            }
        }
    }

    fn show_path(&self, _coordinates: &[Coordinate]) {}
}

#[tokio::test]
async fn test_interrupt_keeps_recorded_steps() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let devices = devices(MockCamera::new(8, 8), MockStage::new());
    let presenter = Arc::new(InterruptingPresenter::default());

    let mut controller = ScanController::new(
        config(dir.path(), 9),
        &devices.registry,
        Arc::new(store.clone()),
        presenter.clone(),
    )
    .await
    .unwrap();

    let run = controller.prepare_measurement().await.unwrap();
    assert!(presenter.handle.set(run.handle()).is_ok());
    let dataset = run.dataset().to_path_buf();

    let report = controller.execute(run).await.unwrap();
    assert!(report.summary.interrupted);
    assert_eq!(report.summary.steps_completed, 1);
    assert_eq!(report.session.reserved_steps, 9);
    assert_eq!(report.session.recorded_steps, 1);
    assert!(!report.session.aborted);

    let stored = store.dataset(&dataset).unwrap();
    assert_eq!(stored.measurements.len(), 1);
    assert_eq!(devices.stage.xy(), (0.0, 0.0));
}

#[tokio::test]
async fn test_dropped_run_does_not_block_next_measurement() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let devices = devices(MockCamera::new(8, 8), MockStage::new());
    let mut controller = ScanController::new(
        config(dir.path(), 4),
        &devices.registry,
        Arc::new(store.clone()),
        Arc::new(RecordingPresenter::new()),
    )
    .await
    .unwrap();

    let run = controller.prepare_measurement().await.unwrap();
    let abandoned = run.dataset().to_path_buf();
    drop(run);

    // Parameters may change again once nothing can execute the open dataset
    controller
        .update_parameters(GridSpec::raster(60.0, 0.5, 4))
        .unwrap();

    let report = controller.measure().await.unwrap();
    assert_eq!(report.session.path, dir.path().join("ptychodata_m2"));
    assert_eq!(report.session.recorded_steps, 4);

    let stale = store.dataset(&abandoned).unwrap();
    assert!(stale.finished);
    assert!(stale.measurements.is_empty());
    assert_eq!(devices.camera.frame_count(), 4);
}

#[tokio::test]
async fn test_cancel_closes_prepared_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let devices = devices(MockCamera::new(8, 8), MockStage::new());
    let mut controller = ScanController::new(
        config(dir.path(), 4),
        &devices.registry,
        Arc::new(store.clone()),
        Arc::new(RecordingPresenter::new()),
    )
    .await
    .unwrap();

    let run = controller.prepare_measurement().await.unwrap();
    let report = controller.cancel(run).await.unwrap();
    assert!(report.aborted);
    assert_eq!(report.recorded_steps, 0);
    assert_eq!(report.reserved_steps, 4);
    assert!(!controller.session().is_active());
    assert!(store.dataset(&report.path).unwrap().finished);
    assert!(devices.stage.moves().is_empty());
    assert_eq!(devices.camera.start_count(), 0);

    let next = controller.measure().await.unwrap();
    assert_eq!(next.session.path, dir.path().join("ptychodata_m2"));
}
