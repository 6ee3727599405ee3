//! The acquisition sequencer.
//!
//! One worker task per run traverses the coordinate list: advance the shared
//! index, move the stage, capture a frame, emit [`SequencerEvent::StepCompleted`],
//! then wait for the controller to answer with [`SequencerCommand::Proceed`].
//! Because the next step is only triggered from inside the controller's event
//! handling, at most one move or capture is ever in flight and storage never
//! falls behind the stage.
//!
//! # Architecture
//!
//! ```text
//! Controller ──Proceed/Abort──> worker ──StepCompleted/Finished/Failed──> Controller
//!      │                          │
//!      └──interrupt()──> Mutex<SequenceState> <──advance()
//! ```
//!
//! A sequencer built with [`AcquisitionSequencer::detector_only`] has no stage:
//! every step is a capture in place, either a fixed number of times or until
//! interrupted, and the finishing step makes no move.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::capture::{capture_frame, CapturePolicy};
use super::state::{SequenceState, SequencerPhase, StepTarget};
use crate::error::{AppResult, DaqError};
use crate::grid::Coordinate;
use crate::hardware::{Axis, Frame, FrameSource, StagePositioner};

/// Default capacity of the event and command channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// One completed grid step.
#[derive(Debug, Clone)]
pub struct CapturedStep {
    /// Position in the coordinate list
    pub index: usize,
    /// Commanded position, relative to the origin
    pub target: Coordinate,
    /// Position read back from the stage after the move, relative to the origin
    pub position: Coordinate,
    /// Captured frame
    pub frame: Frame,
    /// Polls the capture needed
    pub polls: u32,
}

/// Outcome of a run that reached `Finished` without a device failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    /// Number of `StepCompleted` events emitted
    pub steps_completed: usize,
    /// Length of the coordinate list
    pub total_steps: usize,
    /// An interrupt shortened the run
    pub interrupted: bool,
    /// The controller aborted the run
    pub aborted: bool,
    /// Last known stage position, relative to the origin
    pub final_position: Coordinate,
}

/// Events from the worker, delivered in FIFO order.
#[derive(Debug, Clone)]
pub enum SequencerEvent {
    /// A step finished both its move and its capture
    StepCompleted(CapturedStep),
    /// The run is over; no further events follow
    Finished(RunSummary),
    /// A device failed; the run is over and no further events follow
    Failed(String),
}

/// Commands from the controller to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerCommand {
    /// The last event has been handled; run the next step
    Proceed,
    /// Stop without further moves
    Abort,
}

/// Cheap, cloneable handle for interrupting and observing a sequencer.
#[derive(Clone)]
pub struct SequencerHandle {
    state: Arc<Mutex<SequenceState>>,
}

impl SequencerHandle {
    /// Request cooperative early completion.
    ///
    /// The step in flight is not cut short; the run finishes at the next step
    /// boundary. Returns whether the request changed anything: before start and
    /// after the path has finished this is a no-op.
    pub fn interrupt(&self) -> bool {
        let (applied, phase, path_finished) = {
            let mut state = self.state.lock();
            let applied = state.skip_to_end();
            (applied, state.phase(), state.path_finished())
        };
        if applied {
            info!("Interrupt requested, finishing after the current step");
        } else if phase == SequencerPhase::Idle {
            warn!("Interrupt ignored: sequencer not started");
        } else if path_finished {
            debug!(%phase, "Interrupt ignored: path already finished");
        } else {
            debug!(%phase, "Interrupt ignored: run already ended");
        }
        applied
    }

    /// Current traversal index (`-1` before the first and after the last step).
    pub fn current_index(&self) -> i64 {
        self.state.lock().current_index()
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SequencerPhase {
        self.state.lock().phase()
    }

    /// Whether the run reached `Finished`.
    pub fn is_finished(&self) -> bool {
        self.phase().is_finished()
    }

    /// Whether the finishing transition has happened.
    pub fn path_finished(&self) -> bool {
        self.state.lock().path_finished()
    }

    /// Number of grid points; `0` when running until interrupted.
    pub fn total(&self) -> usize {
        self.state.lock().total()
    }

    /// Whether the run continues until interrupted.
    pub fn is_continuous(&self) -> bool {
        self.state.lock().is_continuous()
    }

    /// How often the index was reset to `-1`.
    pub fn index_resets(&self) -> u32 {
        self.state.lock().index_resets()
    }
}

/// Channels and handles of a started run.
pub struct SequencerRun {
    /// Event stream from the worker
    pub events: mpsc::Receiver<SequencerEvent>,
    /// Command sink towards the worker
    pub commands: mpsc::Sender<SequencerCommand>,
    /// Interrupt / status handle
    pub handle: SequencerHandle,
    /// Worker task
    pub worker: JoinHandle<()>,
}

impl SequencerRun {
    /// Tell the worker to run the next step.
    pub async fn proceed(&self) -> AppResult<()> {
        self.commands
            .send(SequencerCommand::Proceed)
            .await
            .map_err(|_| DaqError::ChannelClosed)
    }

    /// Tell the worker to stop without further moves.
    pub async fn abort(&self) -> AppResult<()> {
        self.commands
            .send(SequencerCommand::Abort)
            .await
            .map_err(|_| DaqError::ChannelClosed)
    }

    /// Next event, `None` once the worker is gone.
    pub async fn next_event(&mut self) -> Option<SequencerEvent> {
        self.events.recv().await
    }
}

/// Traverses a coordinate list with one move and one capture per point.
///
/// # Example
///
/// ```rust,ignore
/// let sequencer = AcquisitionSequencer::new(camera, stage, coordinates);
/// let mut run = sequencer.start().await?;
/// while let Some(event) = run.next_event().await {
///     match event {
///         SequencerEvent::StepCompleted(step) => {
///             sink.add(step)?;
///             run.proceed().await?;
///         }
///         SequencerEvent::Finished(_) | SequencerEvent::Failed(_) => break,
///     }
/// }
/// ```
pub struct AcquisitionSequencer {
    camera: Arc<dyn FrameSource>,
    camera_name: String,
    stage: Option<Arc<dyn StagePositioner>>,
    stage_name: String,
    policy: CapturePolicy,
    origin: Option<Coordinate>,
    channel_capacity: usize,
    state: Arc<Mutex<SequenceState>>,
}

impl AcquisitionSequencer {
    /// Sequencer over `coordinates`, owning the given devices for the run.
    pub fn new(
        camera: Arc<dyn FrameSource>,
        stage: Arc<dyn StagePositioner>,
        coordinates: impl Into<Arc<[Coordinate]>>,
    ) -> Self {
        Self::with_state(
            camera,
            Some(stage),
            SequenceState::new(coordinates.into()),
        )
    }

    /// Sequencer that only fires the camera: `frames` captures in place, or
    /// captures until interrupted when `frames` is `None`.
    pub fn detector_only(camera: Arc<dyn FrameSource>, frames: Option<usize>) -> Self {
        let state = match frames {
            Some(frames) => SequenceState::new(vec![Coordinate::ORIGIN; frames].into()),
            None => SequenceState::continuous(),
        };
        Self::with_state(camera, None, state)
    }

    fn with_state(
        camera: Arc<dyn FrameSource>,
        stage: Option<Arc<dyn StagePositioner>>,
        state: SequenceState,
    ) -> Self {
        Self {
            camera,
            camera_name: "camera".to_string(),
            stage,
            stage_name: "positioner".to_string(),
            policy: CapturePolicy::default(),
            origin: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Device names used in logs and errors.
    pub fn with_device_names(
        mut self,
        camera: impl Into<String>,
        stage: impl Into<String>,
    ) -> Self {
        self.camera_name = camera.into();
        self.stage_name = stage.into();
        self
    }

    /// Capture polling policy.
    pub fn with_capture_policy(mut self, policy: CapturePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Use a fixed absolute origin instead of the stage position at start.
    pub fn with_origin(mut self, origin: Coordinate) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Capacity of the event and command channels (at least 1).
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Handle for interrupting and observing this sequencer.
    pub fn handle(&self) -> SequencerHandle {
        SequencerHandle {
            state: Arc::clone(&self.state),
        }
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SequencerPhase {
        self.state.lock().phase()
    }

    /// Leave `Idle` and spawn the worker, which immediately runs the first step.
    ///
    /// # Errors
    /// - [`DaqError::InvalidState`] unless the sequencer is `Idle`
    /// - [`DaqError::Device`] when the origin cannot be read from the stage
    pub async fn start(&self) -> AppResult<SequencerRun> {
        let phase = self.phase();
        if !phase.can_start() {
            return Err(DaqError::InvalidState(format!(
                "Cannot start sequencer in {phase} state"
            )));
        }

        let absolute = match &self.stage {
            Some(stage) => read_position(stage.as_ref(), &self.stage_name).await?,
            None => self.origin.unwrap_or(Coordinate::ORIGIN),
        };
        let origin = self.origin.unwrap_or(absolute);
        self.state.lock().begin(origin)?;

        let (event_tx, event_rx) = mpsc::channel(self.channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(self.channel_capacity);

        let worker = Worker {
            camera: Arc::clone(&self.camera),
            camera_name: self.camera_name.clone(),
            stage: self.stage.clone(),
            stage_name: self.stage_name.clone(),
            policy: self.policy.clone(),
            state: Arc::clone(&self.state),
            origin,
            position: absolute - origin,
            steps_completed: 0,
            events: event_tx,
            commands: command_rx,
        };

        let handle = self.handle();
        info!(
            total = handle.total(),
            continuous = handle.is_continuous(),
            origin = %origin,
            camera = %self.camera_name,
            positioner = self.stage.as_ref().map(|_| self.stage_name.as_str()),
            "Sequencer started"
        );
        let worker = tokio::spawn(worker.run());

        Ok(SequencerRun {
            events: event_rx,
            commands: command_tx,
            handle: self.handle(),
            worker,
        })
    }
}

async fn read_position(stage: &dyn StagePositioner, name: &str) -> AppResult<Coordinate> {
    let x = stage
        .position(Axis::X)
        .await
        .map_err(|e| DaqError::device(name, "read position X", e))?;
    let y = stage
        .position(Axis::Y)
        .await
        .map_err(|e| DaqError::device(name, "read position Y", e))?;
    Ok(Coordinate::new(x, y))
}

struct Worker {
    camera: Arc<dyn FrameSource>,
    camera_name: String,
    stage: Option<Arc<dyn StagePositioner>>,
    stage_name: String,
    policy: CapturePolicy,
    state: Arc<Mutex<SequenceState>>,
    origin: Coordinate,
    position: Coordinate,
    steps_completed: usize,
    events: mpsc::Sender<SequencerEvent>,
    commands: mpsc::Receiver<SequencerCommand>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            let target = self.state.lock().advance();

            match target {
                StepTarget::Grid { index, coordinate } => {
                    let step = match self.step(index, coordinate).await {
                        Ok(step) => step,
                        Err(err) => return self.fail(err).await,
                    };

                    if self
                        .events
                        .send(SequencerEvent::StepCompleted(step))
                        .await
                        .is_err()
                    {
                        warn!(index, "Event receiver dropped, stopping sequencer");
                        self.state.lock().finish();
                        return;
                    }
                    self.steps_completed += 1;

                    match self.commands.recv().await {
                        Some(SequencerCommand::Proceed) => continue,
                        Some(SequencerCommand::Abort) => {
                            warn!(index, "Sequencer aborted by controller");
                            return self.finish(true).await;
                        }
                        None => {
                            warn!(index, "Command sender dropped, stopping sequencer");
                            self.state.lock().finish();
                            return;
                        }
                    }
                }
                StepTarget::ReturnToOrigin => {
                    debug!("Path finished, returning to origin");
                    if let Err(err) = self.move_to(Coordinate::ORIGIN).await {
                        return self.fail(err).await;
                    }
                    return self.finish(false).await;
                }
                StepTarget::Done => return self.finish(false).await,
            }
        }
    }

    async fn step(&mut self, index: usize, target: Coordinate) -> AppResult<CapturedStep> {
        self.move_to(target).await?;
        let captured =
            capture_frame(self.camera.as_ref(), &self.camera_name, &self.policy).await?;

        info!(
            index,
            x = self.position.x,
            y = self.position.y,
            polls = captured.polls,
            "Step completed"
        );
        Ok(CapturedStep {
            index,
            target,
            position: self.position,
            frame: captured.frame,
            polls: captured.polls,
        })
    }

    /// Move to a relative target, X then Y, and store the position read back.
    ///
    /// Without a stage this is a no-op and the position stays where it was.
    async fn move_to(&mut self, target: Coordinate) -> AppResult<()> {
        let Some(stage) = self.stage.clone() else {
            return Ok(());
        };
        let delta = target - self.position;
        for axis in Axis::ALL {
            let amount = match axis {
                Axis::X => delta.x,
                Axis::Y => delta.y,
            };
            let operation = match axis {
                Axis::X => "move X",
                Axis::Y => "move Y",
            };
            stage
                .move_rel(amount, axis)
                .await
                .map_err(|e| DaqError::device(&self.stage_name, operation, e))?;
        }

        let absolute = read_position(stage.as_ref(), &self.stage_name).await?;
        self.position = absolute - self.origin;
        let drift = self.position.distance(&target);
        if drift > 0.0 {
            debug!(commanded = %target, reached = %self.position, drift, "Stage settled off target");
        }
        Ok(())
    }

    async fn finish(self, aborted: bool) {
        let (total, interrupted) = {
            let mut state = self.state.lock();
            state.finish();
            (state.total(), state.interrupted())
        };
        let summary = RunSummary {
            steps_completed: self.steps_completed,
            total_steps: total,
            interrupted,
            aborted,
            final_position: self.position,
        };
        info!(
            steps = summary.steps_completed,
            total = summary.total_steps,
            interrupted,
            aborted,
            "Sequencer finished"
        );
        let _ = self.events.send(SequencerEvent::Finished(summary)).await;
    }

    async fn fail(self, err: DaqError) {
        self.state.lock().finish();
        error!(error = %err, steps = self.steps_completed, "Sequencer failed");
        let _ = self.events.send(SequencerEvent::Failed(err.to_string())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockCamera, MockStage};
    use tracing_test::traced_test;

    fn line(n: usize) -> Vec<Coordinate> {
        (0..n).map(|i| Coordinate::new(i as f64, 0.0)).collect()
    }

    #[tokio::test]
    async fn test_start_requires_idle() {
        let sequencer = AcquisitionSequencer::new(
            Arc::new(MockCamera::new(2, 2)),
            Arc::new(MockStage::new()),
            line(1),
        );
        let _run = sequencer.start().await.unwrap();
        assert!(matches!(
            sequencer.start().await,
            Err(DaqError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_positions_are_relative_to_start() {
        let stage = Arc::new(MockStage::with_position(10.0, 5.0));
        let sequencer =
            AcquisitionSequencer::new(Arc::new(MockCamera::new(2, 2)), stage.clone(), line(2));
        let mut run = sequencer.start().await.unwrap();

        let mut positions = Vec::new();
        while let Some(event) = run.next_event().await {
            match event {
                SequencerEvent::StepCompleted(step) => {
                    positions.push(step.position);
                    run.proceed().await.unwrap();
                }
                SequencerEvent::Finished(summary) => {
                    assert_eq!(summary.steps_completed, 2);
                    assert_eq!(summary.final_position, Coordinate::ORIGIN);
                }
                SequencerEvent::Failed(msg) => panic!("unexpected failure: {msg}"),
            }
        }

        assert_eq!(positions, vec![Coordinate::new(0.0, 0.0), Coordinate::new(1.0, 0.0)]);
        assert_eq!(stage.xy(), (10.0, 5.0));
    }

    #[tokio::test]
    async fn test_stage_failure_emits_failed() {
        let stage = Arc::new(MockStage::new().fail_on_move(3));
        let sequencer =
            AcquisitionSequencer::new(Arc::new(MockCamera::new(2, 2)), stage, line(3));
        let mut run = sequencer.start().await.unwrap();

        let mut completed = 0;
        let mut failure = None;
        while let Some(event) = run.next_event().await {
            match event {
                SequencerEvent::StepCompleted(_) => {
                    completed += 1;
                    run.proceed().await.unwrap();
                }
                SequencerEvent::Failed(msg) => failure = Some(msg),
                SequencerEvent::Finished(_) => panic!("run must not finish normally"),
            }
        }

        assert_eq!(completed, 1, "move #3 is the X move of step 1");
        assert!(failure.unwrap().contains("move X"));
        assert!(run.handle.is_finished());
    }

    #[tokio::test]
    async fn test_abort_stops_without_return_move() {
        let stage = Arc::new(MockStage::new());
        let sequencer =
            AcquisitionSequencer::new(Arc::new(MockCamera::new(2, 2)), stage.clone(), line(3));
        let mut run = sequencer.start().await.unwrap();

        let first = run.next_event().await.unwrap();
        assert!(matches!(first, SequencerEvent::StepCompleted(_)));
        run.abort().await.unwrap();

        match run.next_event().await {
            Some(SequencerEvent::Finished(summary)) => {
                assert!(summary.aborted);
                assert_eq!(summary.steps_completed, 1);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(run.next_event().await.is_none());
        assert_eq!(stage.moves().len(), 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_interrupt_after_abort_reports_run_ended() {
        let sequencer = AcquisitionSequencer::new(
            Arc::new(MockCamera::new(2, 2)),
            Arc::new(MockStage::new()),
            line(3),
        );
        let mut run = sequencer.start().await.unwrap();
        assert!(matches!(
            run.next_event().await,
            Some(SequencerEvent::StepCompleted(_))
        ));
        run.abort().await.unwrap();
        assert!(matches!(
            run.next_event().await,
            Some(SequencerEvent::Finished(_))
        ));

        assert!(!run.handle.path_finished());
        assert!(!run.handle.interrupt());
        assert!(logs_contain("Interrupt ignored: run already ended"));
        assert!(!logs_contain("path already finished"));
    }
}
