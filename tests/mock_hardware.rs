//! Integration tests for mock hardware implementations
//!
//! These tests verify that MockStage and MockCamera correctly implement
//! the capability traits and behave the way the sequencer expects real
//! devices to behave.

use scan_daq::config::AppConfig;
use scan_daq::hardware::capabilities::{Axis, FrameSource, StagePositioner};
use scan_daq::hardware::mock::{MockCamera, MockStage};
use scan_daq::hardware::DeviceRegistry;
use scan_daq::DaqError;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// MockStage Tests
// =============================================================================

#[tokio::test]
async fn test_mock_stage_movement() {
    let stage = MockStage::new();

    stage.move_rel(10.0, Axis::X).await.unwrap();
    assert_eq!(stage.position(Axis::X).await.unwrap(), 10.0);
    assert_eq!(stage.position(Axis::Y).await.unwrap(), 0.0);

    stage.move_rel(-3.0, Axis::X).await.unwrap();
    stage.move_rel(2.5, Axis::Y).await.unwrap();
    assert_eq!(stage.xy(), (7.0, 2.5));

    assert_eq!(
        stage.moves(),
        vec![(Axis::X, 10.0), (Axis::X, -3.0), (Axis::Y, 2.5)]
    );
}

#[tokio::test(start_paused = true)]
async fn test_mock_stage_timing() {
    let stage = MockStage::new().with_speed(10.0);

    // 20mm at 10mm/sec takes 2 seconds of (virtual) time
    let start = tokio::time::Instant::now();
    stage.move_rel(20.0, Axis::X).await.unwrap();
    let elapsed = start.elapsed();

    assert!(
        elapsed >= Duration::from_secs(2) && elapsed < Duration::from_millis(2100),
        "Expected ~2000ms, got {}ms",
        elapsed.as_millis()
    );
}

#[tokio::test]
async fn test_mock_stage_resolution_differs_from_target() {
    let stage = MockStage::with_position(1.0, 1.0).with_resolution(0.01);
    stage.move_rel(0.123, Axis::Y).await.unwrap();

    let y = stage.position(Axis::Y).await.unwrap();
    assert!((y - 1.12).abs() < 1e-9, "y = {y}");
}

// =============================================================================
// MockCamera Tests
// =============================================================================

#[tokio::test]
async fn test_mock_camera_frame_cycle() {
    let camera = MockCamera::new(16, 8).with_empty_polls(1);

    camera.start_acquisition().await.unwrap();
    assert!(camera.latest_frame().await.unwrap().is_none());
    let frame = camera.latest_frame().await.unwrap().unwrap();
    assert_eq!(frame.shape(), (16, 8));
    assert_eq!(frame.pixels().len(), 16 * 8);

    // The next frame is again preceded by an empty poll
    assert!(camera.latest_frame().await.unwrap().is_none());
    camera.stop_acquisition().await.unwrap();

    assert_eq!(camera.start_count(), 1);
    assert_eq!(camera.stop_count(), 1);
    assert_eq!(camera.poll_count(), 3);
    assert_eq!(camera.frame_count(), 1);
}

#[tokio::test]
async fn test_mock_camera_binning_changes_shape() {
    let camera = MockCamera::new(64, 32);
    camera
        .set_parameter("binning", serde_json::json!(4))
        .await
        .unwrap();
    camera
        .set_parameter("exposure", serde_json::json!(25.0))
        .await
        .unwrap();

    assert_eq!(camera.binning(), 4);
    assert_eq!(camera.frame_shape(), (16, 8));
    assert!((camera.exposure().as_secs_f64() - 0.025).abs() < 1e-9);

    camera.start_acquisition().await.unwrap();
    let frame = camera.latest_frame().await.unwrap().unwrap();
    assert_eq!(frame.shape(), (16, 8));
}

#[tokio::test]
async fn test_mock_camera_is_seeded() {
    let a = MockCamera::new(8, 8).with_seed(7);
    let b = MockCamera::new(8, 8).with_seed(7);
    a.start_acquisition().await.unwrap();
    b.start_acquisition().await.unwrap();

    let fa = a.latest_frame().await.unwrap().unwrap();
    let fb = b.latest_frame().await.unwrap().unwrap();
    assert_eq!(fa.pixels(), fb.pixels());
}

// =============================================================================
// Registry Tests
// =============================================================================

#[tokio::test]
async fn test_simulated_registry_follows_config() {
    let mut config = AppConfig::default();
    config.camera.name = "andor".to_string();
    config.positioner.name = "xy-stage".to_string();

    let registry = DeviceRegistry::simulated(&config).unwrap();
    assert_eq!(registry.len(), 2);

    let camera = registry.camera("andor").unwrap();
    assert_eq!(
        camera.frame_shape(),
        (config.camera.sensor_width, config.camera.sensor_height)
    );
    let stage: Arc<dyn StagePositioner> = registry.positioner("xy-stage").unwrap();
    assert_eq!(stage.position(Axis::X).await.unwrap(), 0.0);

    match registry.camera("cam1") {
        Err(DaqError::DeviceNotConfigured {
            role,
            name,
            available,
        }) => {
            assert_eq!(role, "camera");
            assert_eq!(name, "cam1");
            assert_eq!(available, vec!["andor".to_string()]);
        }
        Err(other) => panic!("unexpected error {other}"),
        Ok(_) => panic!("cam1 must not resolve"),
    }
}
