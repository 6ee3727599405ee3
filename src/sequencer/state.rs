//! Traversal state shared between the sequencer worker and interrupt callers.
//!
//! [`SequenceState`] is the only datum touched from more than one context: the
//! worker advances it once per step, and any holder of a
//! [`SequencerHandle`](super::SequencerHandle) may jump it to the last step. Both
//! paths go through the same `parking_lot::Mutex`, and the critical sections are
//! the index update only. Moves and captures happen with the lock released.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::{AppResult, DaqError};
use crate::grid::Coordinate;

/// Lifecycle of one sequencer.
///
/// ```text
/// Idle ──start──> Running ──advance──> Running
///                    │                    │
///               interrupt            path end
///                    ▼                    │
///              Interrupting ──advance──> Finished
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SequencerPhase {
    /// Constructed, not yet started
    Idle,
    /// Visiting grid points
    Running,
    /// Interrupt requested; the next advance is the terminal one
    Interrupting,
    /// Terminal; no further advances
    Finished,
}

impl fmt::Display for SequencerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SequencerPhase::Idle => write!(f, "Idle"),
            SequencerPhase::Running => write!(f, "Running"),
            SequencerPhase::Interrupting => write!(f, "Interrupting"),
            SequencerPhase::Finished => write!(f, "Finished"),
        }
    }
}

impl SequencerPhase {
    /// Check if the phase allows starting.
    pub fn can_start(&self) -> bool {
        matches!(self, SequencerPhase::Idle)
    }

    /// Check if an interrupt request has anything to act on.
    pub fn can_interrupt(&self) -> bool {
        matches!(self, SequencerPhase::Running | SequencerPhase::Interrupting)
    }

    /// Check if the phase is terminal.
    pub fn is_finished(&self) -> bool {
        matches!(self, SequencerPhase::Finished)
    }
}

/// Where the next step goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepTarget {
    /// Visit grid point `index`
    Grid {
        /// Position in the coordinate list
        index: usize,
        /// Relative target position
        coordinate: Coordinate,
    },
    /// Sentinel finishing step: return to origin, no capture
    ReturnToOrigin,
    /// The path has already finished
    Done,
}

/// Traversal index and lifecycle of one run.
///
/// A state built with [`SequenceState::continuous`] has no coordinate list: it
/// keeps yielding in-place steps at the origin until an interrupt arrives.
#[derive(Debug, Clone)]
pub struct SequenceState {
    coordinates: Arc<[Coordinate]>,
    continuous: bool,
    current_index: i64,
    path_finished: bool,
    origin: Coordinate,
    phase: SequencerPhase,
    interrupted: bool,
    index_resets: u32,
}

impl SequenceState {
    /// Fresh state over `coordinates`, index at `-1`.
    pub fn new(coordinates: Arc<[Coordinate]>) -> Self {
        Self {
            coordinates,
            continuous: false,
            current_index: -1,
            path_finished: false,
            origin: Coordinate::ORIGIN,
            phase: SequencerPhase::Idle,
            interrupted: false,
            index_resets: 0,
        }
    }

    /// Fresh open-ended state: every advance yields the origin until interrupted.
    pub fn continuous() -> Self {
        Self {
            continuous: true,
            ..Self::new(Arc::from(Vec::new()))
        }
    }

    /// Leave `Idle` and record the absolute stage origin.
    pub fn begin(&mut self, origin: Coordinate) -> AppResult<()> {
        if !self.phase.can_start() {
            return Err(DaqError::InvalidState(format!(
                "Cannot start sequencer in {} state",
                self.phase
            )));
        }
        self.origin = origin;
        self.phase = SequencerPhase::Running;
        Ok(())
    }

    /// Move to the next target.
    ///
    /// Incrementing past the last grid point marks the path finished, resets the
    /// index to `-1` and yields the return-to-origin step. A continuous traversal
    /// only ends once an interrupt has been accepted.
    pub fn advance(&mut self) -> StepTarget {
        if self.path_finished || self.phase.is_finished() {
            return StepTarget::Done;
        }

        let exhausted = if self.continuous {
            self.phase == SequencerPhase::Interrupting
        } else {
            self.current_index + 1 == self.total() as i64
        };
        if exhausted {
            self.path_finished = true;
            self.current_index = -1;
            self.index_resets += 1;
            return StepTarget::ReturnToOrigin;
        }

        self.current_index += 1;
        let index = self.current_index as usize;
        let coordinate = if self.continuous {
            Coordinate::ORIGIN
        } else {
            self.coordinates[index]
        };
        StepTarget::Grid { index, coordinate }
    }

    /// Make the next advance the terminal one.
    ///
    /// Returns `false` (and changes nothing) before start, once the path has
    /// finished, or after the run reached `Finished`.
    pub fn skip_to_end(&mut self) -> bool {
        if self.path_finished || !self.phase.can_interrupt() {
            return false;
        }
        if !self.continuous {
            self.current_index = self.total() as i64 - 1;
        }
        self.phase = SequencerPhase::Interrupting;
        self.interrupted = true;
        true
    }

    /// Enter the terminal phase.
    pub fn finish(&mut self) {
        self.phase = SequencerPhase::Finished;
    }

    /// Current index; `-1` before the first step and after the finishing transition.
    pub fn current_index(&self) -> i64 {
        self.current_index
    }

    /// Whether the finishing transition has happened.
    pub fn path_finished(&self) -> bool {
        self.path_finished
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SequencerPhase {
        self.phase
    }

    /// Whether an interrupt was accepted during this run.
    pub fn interrupted(&self) -> bool {
        self.interrupted
    }

    /// Absolute stage position relative targets are measured from.
    pub fn origin(&self) -> Coordinate {
        self.origin
    }

    /// Number of grid points; `0` for a continuous traversal.
    pub fn total(&self) -> usize {
        self.coordinates.len()
    }

    /// Whether the traversal runs until interrupted.
    pub fn is_continuous(&self) -> bool {
        self.continuous
    }

    /// How often the index was reset to `-1`.
    pub fn index_resets(&self) -> u32 {
        self.index_resets
    }
}
