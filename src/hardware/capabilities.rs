//! Hardware Capabilities used by the scan sequencer
//!
//! The sequencer never talks to a concrete driver. It holds two small capability
//! traits and nothing else:
//!
//! - A camera implements [`FrameSource`]
//! - A two-axis stage implements [`StagePositioner`]
//!
//! # Design Philosophy
//!
//! Each capability trait:
//! - Is async (uses #[async_trait])
//! - Is thread-safe (requires Send + Sync)
//! - Uses anyhow::Result for errors
//! - Focuses on ONE thing
//!
//! # Example
//!
//! ```rust,ignore
//! async fn snap<C: FrameSource + ?Sized>(camera: &C) -> Result<Option<Frame>> {
//!     camera.start_acquisition().await?;
//!     let frame = camera.latest_frame().await?;
//!     camera.stop_acquisition().await?;
//!     Ok(frame)
//! }
//! ```

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::Frame;

/// Stage axis addressed by [`StagePositioner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Horizontal axis
    X,
    /// Vertical axis
    Y,
}

impl Axis {
    /// Both scan axes in move order.
    pub const ALL: [Axis; 2] = [Axis::X, Axis::Y];
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Axis::X => write!(f, "X"),
            Axis::Y => write!(f, "Y"),
        }
    }
}

/// Capability: Frame Acquisition
///
/// Cameras and other 2D detectors.
///
/// # Contract
/// - `start_acquisition()` arms the sensor; `stop_acquisition()` releases it
/// - `latest_frame()` returns `Ok(None)` (or an empty frame) while no new image is
///   ready. This is "not ready yet", never an error
/// - `exposure()` and `binning()` reflect the last accepted `set_parameter` call
/// - `frame_shape()` is the shape of frames produced with the current binning
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Begin acquiring frames.
    async fn start_acquisition(&self) -> Result<()>;

    /// Stop acquiring frames.
    async fn stop_acquisition(&self) -> Result<()>;

    /// Most recent frame, or `None` when nothing new is available.
    async fn latest_frame(&self) -> Result<Option<Frame>>;

    /// Set a named driver parameter.
    ///
    /// Known names: `"exposure"` (milliseconds) and `"binning"` (integer factor).
    /// Drivers reject names they do not expose.
    async fn set_parameter(&self, name: &str, value: serde_json::Value) -> Result<()>;

    /// Current binning factor.
    fn binning(&self) -> u32;

    /// Current exposure time.
    fn exposure(&self) -> Duration;

    /// Shape `(width, height)` of produced frames.
    fn frame_shape(&self) -> (u32, u32);
}

/// Capability: Two-Axis Motion
///
/// Translation stages carrying the sample.
///
/// # Contract
/// - Positions are in millimetres for the whole session
/// - `move_rel` blocks until the move has completed
/// - `position` reports the encoder value, which may differ slightly from the
///   commanded target (rounding, drift)
#[async_trait]
pub trait StagePositioner: Send + Sync {
    /// Current position on `axis`.
    async fn position(&self, axis: Axis) -> Result<f64>;

    /// Move by `delta` on `axis`.
    async fn move_rel(&self, delta: f64, axis: Axis) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestStage {
        x: parking_lot::Mutex<f64>,
        y: parking_lot::Mutex<f64>,
    }

    #[async_trait]
    impl StagePositioner for TestStage {
        async fn position(&self, axis: Axis) -> Result<f64> {
            Ok(match axis {
                Axis::X => *self.x.lock(),
                Axis::Y => *self.y.lock(),
            })
        }

        async fn move_rel(&self, delta: f64, axis: Axis) -> Result<()> {
            match axis {
                Axis::X => *self.x.lock() += delta,
                Axis::Y => *self.y.lock() += delta,
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_positioner_trait_object() {
        let stage: Box<dyn StagePositioner> = Box::new(TestStage {
            x: parking_lot::Mutex::new(1.0),
            y: parking_lot::Mutex::new(0.0),
        });

        stage.move_rel(2.5, Axis::X).await.unwrap();
        stage.move_rel(-1.0, Axis::Y).await.unwrap();

        assert_eq!(stage.position(Axis::X).await.unwrap(), 3.5);
        assert_eq!(stage.position(Axis::Y).await.unwrap(), -1.0);
    }

    #[test]
    fn test_axis_display() {
        assert_eq!(Axis::X.to_string(), "X");
        assert_eq!(Axis::ALL, [Axis::X, Axis::Y]);
    }
}
