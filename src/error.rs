//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, used by every layer above the
//! device capability traits. Device drivers keep returning `anyhow::Result` (see
//! [`crate::hardware::capabilities`]); the sequencer wraps those failures into
//! [`DaqError::Device`] together with the device name and the operation that failed.
//!
//! ## Error Hierarchy
//!
//! - **`Config`** / **`Configuration`**: figment extraction failures and semantic validation
//!   failures (values that parse but fall outside their declared range).
//! - **`DeviceNotConfigured`**: a camera or positioner named in the configuration is not
//!   registered. Controllers surface this at construction time so the feature can be disabled
//!   instead of crashing.
//! - **`Device`**: an I/O failure reported by a collaborator during a move or capture. Not
//!   retried; the run is forced to `Finished`.
//! - **`CaptureTimeout`**: the camera never produced a non-empty frame within the capture policy.
//! - **`Io`**, **`Serialization`**, **`Csv`**, **`Storage`**: dataset sink failures.
//! - **`InvalidState`**, **`StepOutOfOrder`**, **`ChannelClosed`**, **`SequenceFailed`**:
//!   lifecycle violations between the controller, the session and the sequencer worker.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Application error type.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Configuration could not be loaded or extracted.
    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    /// Configuration loaded but failed validation.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Filesystem failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure (metadata, layout files).
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Step index file failure.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A device referenced by name is missing from the registry.
    #[error("{role} '{name}' is not configured (available: {available:?})")]
    DeviceNotConfigured {
        /// Device role ("camera" or "positioner").
        role: &'static str,
        /// Requested device name.
        name: String,
        /// Names that are registered for this role.
        available: Vec<String>,
    },

    /// A collaborator device reported a failure.
    #[error("Device '{device}' failed during {operation}: {source}")]
    Device {
        /// Device name.
        device: String,
        /// Operation that failed (e.g. "move X", "start acquisition").
        operation: &'static str,
        /// Underlying driver error.
        #[source]
        source: anyhow::Error,
    },

    /// No non-empty frame arrived within the capture policy.
    #[error("No frame after {polls} polls ({elapsed:?})")]
    CaptureTimeout {
        /// Number of `latest_frame` polls performed.
        polls: u32,
        /// Time spent polling.
        elapsed: Duration,
    },

    /// Operation not allowed in the current lifecycle state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A step was recorded out of emission order.
    #[error("Step recorded out of order: expected index {expected}, got {got}")]
    StepOutOfOrder {
        /// Next index the session expects.
        expected: usize,
        /// Index that was offered.
        got: usize,
    },

    /// Dataset sink rejected an operation.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The sequencer worker stopped because of a device failure.
    #[error("Sequence failed: {0}")]
    SequenceFailed(String),

    /// The peer side of a sequencer channel went away.
    #[error("Sequencer channel closed")]
    ChannelClosed,
}

impl DaqError {
    /// Wrap a driver error with the device name and the operation that failed.
    pub fn device(device: impl Into<String>, operation: &'static str, source: anyhow::Error) -> Self {
        DaqError::Device {
            device: device.into(),
            operation,
            source,
        }
    }

    /// Whether the failure came from collaborator hardware rather than from local bookkeeping.
    #[must_use]
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            DaqError::Device { .. } | DaqError::CaptureTimeout { .. }
        )
    }
}
