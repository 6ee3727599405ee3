//! Mock Hardware Implementations
//!
//! Provides simulated devices for running scans without physical hardware.
//! All mock devices use async-safe operations (tokio::time::sleep, not std::thread::sleep).
//!
//! # Available Mocks
//!
//! - `MockStage` - Two-axis stage with optional encoder quantisation and travel time
//! - `MockCamera` - Camera with scripted "not ready" polls and a noisy test pattern
//!
//! Both mocks can inject a failure on the N-th operation so error paths of the
//! sequencer and controller can be exercised.

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

use crate::hardware::capabilities::{Axis, FrameSource, StagePositioner};
use crate::hardware::Frame;

// =============================================================================
// MockStage - Simulated Two-Axis Stage
// =============================================================================

/// Mock two-axis stage.
///
/// Simulates:
/// - Optional travel time (`with_speed`)
/// - Optional encoder quantisation (`with_resolution`), so the read-back position
///   differs from the commanded one
/// - A move log for assertions
///
/// # Example
///
/// ```rust,ignore
/// let stage = MockStage::new().with_resolution(0.001);
/// stage.move_rel(0.0004, Axis::X).await?;
/// assert_eq!(stage.position(Axis::X).await?, 0.0);
/// ```
pub struct MockStage {
    position: Mutex<[f64; 2]>,
    resolution_mm: Option<f64>,
    speed_mm_per_sec: Option<f64>,
    moves: Mutex<Vec<(Axis, f64)>>,
    fail_on_move: Option<usize>,
}

impl MockStage {
    /// Create a stage at (0, 0) with instantaneous, exact moves.
    pub fn new() -> Self {
        Self::with_position(0.0, 0.0)
    }

    /// Create a stage at the given position.
    pub fn with_position(x: f64, y: f64) -> Self {
        Self {
            position: Mutex::new([x, y]),
            resolution_mm: None,
            speed_mm_per_sec: None,
            moves: Mutex::new(Vec::new()),
            fail_on_move: None,
        }
    }

    /// Round every reached position to a multiple of `resolution_mm`.
    pub fn with_resolution(mut self, resolution_mm: f64) -> Self {
        self.resolution_mm = Some(resolution_mm);
        self
    }

    /// Simulate travel time at `speed_mm_per_sec`.
    pub fn with_speed(mut self, speed_mm_per_sec: f64) -> Self {
        self.speed_mm_per_sec = Some(speed_mm_per_sec);
        self
    }

    /// Make the `n`-th move (1-based) fail.
    pub fn fail_on_move(mut self, n: usize) -> Self {
        self.fail_on_move = Some(n);
        self
    }

    /// Every requested relative move, in order.
    pub fn moves(&self) -> Vec<(Axis, f64)> {
        self.moves.lock().clone()
    }

    /// Current `(x, y)` without going through the async trait.
    pub fn xy(&self) -> (f64, f64) {
        let pos = self.position.lock();
        (pos[0], pos[1])
    }

    fn quantise(&self, value: f64) -> f64 {
        match self.resolution_mm {
            Some(res) if res > 0.0 => (value / res).round() * res,
            _ => value,
        }
    }
}

impl Default for MockStage {
    fn default() -> Self {
        Self::new()
    }
}

fn axis_slot(axis: Axis) -> usize {
    match axis {
        Axis::X => 0,
        Axis::Y => 1,
    }
}

#[async_trait]
impl StagePositioner for MockStage {
    async fn position(&self, axis: Axis) -> Result<f64> {
        Ok(self.position.lock()[axis_slot(axis)])
    }

    async fn move_rel(&self, delta: f64, axis: Axis) -> Result<()> {
        let move_number = {
            let mut moves = self.moves.lock();
            moves.push((axis, delta));
            moves.len()
        };
        if self.fail_on_move == Some(move_number) {
            bail!("MockStage: injected failure on move #{}", move_number);
        }

        if let Some(speed) = self.speed_mm_per_sec {
            let delay = Duration::from_secs_f64(delta.abs() / speed);
            // CRITICAL: Use tokio::time::sleep, NOT std::thread::sleep
            sleep(delay).await;
        }

        let reached = {
            let mut pos = self.position.lock();
            let slot = axis_slot(axis);
            pos[slot] = self.quantise(pos[slot] + delta);
            pos[slot]
        };
        debug!(%axis, delta, reached, "MockStage moved");
        Ok(())
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Mock camera.
///
/// Simulates a camera with:
/// - Configurable sensor shape; binning divides the produced frame shape
/// - `with_empty_polls(k)`: each frame is preceded by `k` polls returning `None`
/// - A deterministic, seeded test pattern with noise
/// - Counters for acquisition starts/stops, polls and delivered frames
///
/// # Example
///
/// ```rust,ignore
/// let camera = MockCamera::new(64, 48).with_empty_polls(2);
/// camera.start_acquisition().await?;
/// assert!(camera.latest_frame().await?.is_none());
/// ```
pub struct MockCamera {
    sensor_shape: (u32, u32),
    exposure_ms: RwLock<f64>,
    binning: AtomicU32,
    acquiring: AtomicBool,
    empty_polls: u32,
    pending_empty: AtomicU32,
    fail_on_frame: Option<u64>,
    starts: AtomicU64,
    stops: AtomicU64,
    polls: AtomicU64,
    frames: AtomicU64,
    rng: Mutex<StdRng>,
}

impl MockCamera {
    /// Create a camera with the given sensor resolution.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            sensor_shape: (width, height),
            exposure_ms: RwLock::new(10.0),
            binning: AtomicU32::new(1),
            acquiring: AtomicBool::new(false),
            empty_polls: 0,
            pending_empty: AtomicU32::new(0),
            fail_on_frame: None,
            starts: AtomicU64::new(0),
            stops: AtomicU64::new(0),
            polls: AtomicU64::new(0),
            frames: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(42)),
        }
    }

    /// Return `None` for `count` polls before every frame.
    pub fn with_empty_polls(mut self, count: u32) -> Self {
        self.empty_polls = count;
        self.pending_empty = AtomicU32::new(count);
        self
    }

    /// Initial exposure in milliseconds.
    pub fn with_exposure_ms(self, exposure_ms: f64) -> Self {
        *self.exposure_ms.write() = exposure_ms;
        self
    }

    /// Make the `n`-th frame (1-based) fail instead of being delivered.
    pub fn fail_on_frame(mut self, n: u64) -> Self {
        self.fail_on_frame = Some(n);
        self
    }

    /// Seed for the noise generator.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Number of `start_acquisition` calls.
    pub fn start_count(&self) -> u64 {
        self.starts.load(Ordering::SeqCst)
    }

    /// Number of `stop_acquisition` calls.
    pub fn stop_count(&self) -> u64 {
        self.stops.load(Ordering::SeqCst)
    }

    /// Number of `latest_frame` calls.
    pub fn poll_count(&self) -> u64 {
        self.polls.load(Ordering::SeqCst)
    }

    /// Number of non-empty frames handed out.
    pub fn frame_count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }

    /// Whether the camera is between start and stop.
    pub fn is_acquiring(&self) -> bool {
        self.acquiring.load(Ordering::SeqCst)
    }

    fn render(&self, frame_number: u64) -> Result<Frame> {
        let (width, height) = self.frame_shape();
        let mut rng = self.rng.lock();
        let data = (0..height)
            .flat_map(|y| (0..width).map(move |x| (x, y)))
            .map(|(x, y)| {
                let base = (u64::from(x) + u64::from(y) + frame_number) % 4096;
                base as u16 + rng.gen_range(0..16)
            })
            .collect();
        Frame::new(width, height, data)
    }
}

impl Default for MockCamera {
    fn default() -> Self {
        Self::new(128, 128)
    }
}

#[async_trait]
impl FrameSource for MockCamera {
    async fn start_acquisition(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.pending_empty.store(self.empty_polls, Ordering::SeqCst);
        self.acquiring.store(true, Ordering::SeqCst);
        debug!("MockCamera: acquisition started");
        Ok(())
    }

    async fn stop_acquisition(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.acquiring.store(false, Ordering::SeqCst);
        debug!("MockCamera: acquisition stopped");
        Ok(())
    }

    async fn latest_frame(&self) -> Result<Option<Frame>> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        if !self.is_acquiring() {
            return Ok(None);
        }

        let pending = self.pending_empty.load(Ordering::SeqCst);
        if pending > 0 {
            self.pending_empty.store(pending - 1, Ordering::SeqCst);
            return Ok(None);
        }

        let frame_number = self.frames.load(Ordering::SeqCst) + 1;
        if self.fail_on_frame == Some(frame_number) {
            bail!("MockCamera: injected failure on frame #{}", frame_number);
        }

        let frame = self.render(frame_number)?;
        self.frames.store(frame_number, Ordering::SeqCst);
        self.pending_empty.store(self.empty_polls, Ordering::SeqCst);
        Ok(Some(frame))
    }

    async fn set_parameter(&self, name: &str, value: serde_json::Value) -> Result<()> {
        match name {
            "exposure" => {
                let ms = value
                    .as_f64()
                    .ok_or_else(|| anyhow!("MockCamera: exposure must be a number, got {value}"))?;
                if ms <= 0.0 {
                    bail!("MockCamera: exposure must be positive");
                }
                *self.exposure_ms.write() = ms;
            }
            "binning" => {
                let factor = value
                    .as_u64()
                    .ok_or_else(|| anyhow!("MockCamera: binning must be an integer, got {value}"))?;
                if !matches!(factor, 1 | 2 | 4) {
                    bail!("MockCamera: unsupported binning {factor}");
                }
                self.binning.store(factor as u32, Ordering::SeqCst);
            }
            other => bail!("MockCamera: non-existent parameter \"{other}\""),
        }
        Ok(())
    }

    fn binning(&self) -> u32 {
        self.binning.load(Ordering::SeqCst)
    }

    fn exposure(&self) -> Duration {
        Duration::from_secs_f64(*self.exposure_ms.read() / 1000.0)
    }

    fn frame_shape(&self) -> (u32, u32) {
        let binning = self.binning().max(1);
        (self.sensor_shape.0 / binning, self.sensor_shape.1 / binning)
    }
}
