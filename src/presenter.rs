//! Live display of a running scan.
//!
//! A [`Presenter`] only observes: it receives each captured frame, the stage
//! position with step progress, and the planned path. Nothing it does feeds back
//! into the sequencer.

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::grid::Coordinate;
use crate::hardware::Frame;

/// Display collaborator.
pub trait Presenter: Send + Sync {
    /// Show the latest frame of camera `name`.
    fn show_frame(&self, name: &str, frame: &Frame);

    /// Show the stage at `position` on step `step` of `total`.
    ///
    /// `step` is `None` when the stage is not at a grid point (before a run or
    /// after the return to origin).
    fn show_progress(&self, position: Coordinate, step: Option<usize>, total: usize);

    /// Show the planned path.
    fn show_path(&self, coordinates: &[Coordinate]);
}

/// Presenter that reports through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPresenter;

impl Presenter for TracingPresenter {
    fn show_frame(&self, name: &str, frame: &Frame) {
        let (width, height) = frame.shape();
        let peak = frame.pixels().iter().copied().max().unwrap_or(0);
        debug!(camera = name, width, height, peak, "Frame");
    }

    fn show_progress(&self, position: Coordinate, step: Option<usize>, total: usize) {
        match step {
            Some(index) => info!(
                step = index + 1,
                total,
                x = position.x,
                y = position.y,
                "Scan progress"
            ),
            None => info!(total, x = position.x, y = position.y, "Stage at rest"),
        }
    }

    fn show_path(&self, coordinates: &[Coordinate]) {
        let first = coordinates.first().copied().unwrap_or_default();
        let last = coordinates.last().copied().unwrap_or_default();
        info!(points = coordinates.len(), first = %first, last = %last, "Scan path");
    }
}

/// Call captured by a [`RecordingPresenter`].
#[derive(Debug, Clone, PartialEq)]
pub enum PresenterCall {
    /// `show_frame(name, ..)` with the frame shape
    Frame(String, (u32, u32)),
    /// `show_progress`
    Progress(Coordinate, Option<usize>, usize),
    /// `show_path` with the number of points
    Path(usize),
}

/// Presenter that remembers every call.
#[derive(Debug, Default)]
pub struct RecordingPresenter {
    calls: Mutex<Vec<PresenterCall>>,
}

impl RecordingPresenter {
    /// Empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls so far, in order.
    pub fn calls(&self) -> Vec<PresenterCall> {
        self.calls.lock().clone()
    }

    /// Progress calls that referred to a grid step, as step indices.
    pub fn steps_shown(&self) -> Vec<usize> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                PresenterCall::Progress(_, Some(step), _) => Some(*step),
                _ => None,
            })
            .collect()
    }
}

impl Presenter for RecordingPresenter {
    fn show_frame(&self, name: &str, frame: &Frame) {
        self.calls
            .lock()
            .push(PresenterCall::Frame(name.to_string(), frame.shape()));
    }

    fn show_progress(&self, position: Coordinate, step: Option<usize>, total: usize) {
        self.calls
            .lock()
            .push(PresenterCall::Progress(position, step, total));
    }

    fn show_path(&self, coordinates: &[Coordinate]) {
        self.calls.lock().push(PresenterCall::Path(coordinates.len()));
    }
}
