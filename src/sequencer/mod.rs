//! Acquisition sequencing: grid traversal, per-step move and capture, interruption.

pub mod capture;
pub mod engine;
pub mod state;

pub use capture::{capture_frame, CapturePolicy, CapturedFrame};
pub use engine::{
    AcquisitionSequencer, CapturedStep, RunSummary, SequencerCommand, SequencerEvent,
    SequencerHandle, SequencerRun,
};
pub use state::{SequenceState, SequencerPhase, StepTarget};
