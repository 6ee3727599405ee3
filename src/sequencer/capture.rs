//! Capture-with-retry.
//!
//! Cameras report "not ready yet" by returning no frame (or an empty one). The
//! capture loop polls until a real frame arrives, sleeping between polls for a
//! fraction of the exposure time so a fast camera is not kept waiting while a
//! slow one is not hammered. Unlike a bare busy-wait the loop is bounded: it gives
//! up after [`CapturePolicy::timeout`] or [`CapturePolicy::max_polls`] empty polls.

use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};

use crate::config::CaptureConfig;
use crate::error::{AppResult, DaqError};
use crate::hardware::{Frame, FrameSource};

/// Shortest sleep between polls.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Bounds for one capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturePolicy {
    /// Give up once this much time has passed without enough frames
    pub timeout: Duration,
    /// Give up after this many empty polls
    pub max_polls: Option<u32>,
    /// Upper bound for the sleep between polls
    pub max_poll_interval: Duration,
    /// Frames averaged into the returned frame
    pub average_frames: u32,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        Self::from_config(&CaptureConfig::default())
    }
}

impl CapturePolicy {
    /// Policy from the `[capture]` configuration section.
    pub fn from_config(config: &CaptureConfig) -> Self {
        Self {
            timeout: config.timeout,
            max_polls: config.max_polls,
            max_poll_interval: config.max_poll_interval,
            average_frames: config.average_frames.max(1),
        }
    }

    /// Sleep between polls: `min(max_poll_interval, exposure / 10)`, never below
    /// [`MIN_POLL_INTERVAL`].
    pub fn poll_interval(&self, exposure: Duration) -> Duration {
        self.max_poll_interval
            .min(exposure / 10)
            .max(MIN_POLL_INTERVAL)
    }
}

/// Result of a successful capture.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    /// Delivered (possibly averaged) frame
    pub frame: Frame,
    /// Number of `latest_frame` calls, empty ones included
    pub polls: u32,
    /// Time from acquisition start to the last frame
    pub elapsed: Duration,
}

/// Start acquisition, poll until enough non-empty frames arrived, stop acquisition.
///
/// The camera is stopped on every exit path. When both the capture and the stop
/// fail, the capture error is returned and the stop failure is logged.
pub async fn capture_frame(
    camera: &dyn FrameSource,
    camera_name: &str,
    policy: &CapturePolicy,
) -> AppResult<CapturedFrame> {
    camera
        .start_acquisition()
        .await
        .map_err(|e| DaqError::device(camera_name, "start acquisition", e))?;

    let captured = poll_frames(camera, camera_name, policy).await;
    let stopped = camera.stop_acquisition().await;

    match (captured, stopped) {
        (Ok(captured), Ok(())) => Ok(captured),
        (Ok(_), Err(e)) => Err(DaqError::device(camera_name, "stop acquisition", e)),
        (Err(err), Ok(())) => Err(err),
        (Err(err), Err(stop_err)) => {
            warn!(camera = camera_name, error = %stop_err, "Failed to stop acquisition after capture error");
            Err(err)
        }
    }
}

async fn poll_frames(
    camera: &dyn FrameSource,
    camera_name: &str,
    policy: &CapturePolicy,
) -> AppResult<CapturedFrame> {
    let started = Instant::now();
    let interval = policy.poll_interval(camera.exposure());
    let wanted = policy.average_frames.max(1) as usize;
    let mut frames = Vec::with_capacity(wanted);
    let mut polls = 0u32;
    let mut empty_polls = 0u32;

    while frames.len() < wanted {
        polls += 1;
        let latest = camera
            .latest_frame()
            .await
            .map_err(|e| DaqError::device(camera_name, "read frame", e))?;

        match latest {
            Some(frame) if !frame.is_empty() => {
                frames.push(frame);
                continue;
            }
            _ => empty_polls += 1,
        }

        let elapsed = started.elapsed();
        let polls_exhausted = policy.max_polls.is_some_and(|max| empty_polls >= max);
        if elapsed >= policy.timeout || polls_exhausted {
            warn!(camera = camera_name, polls, ?elapsed, "Camera produced no frame");
            return Err(DaqError::CaptureTimeout { polls, elapsed });
        }

        trace!(camera = camera_name, polls, "Frame not ready");
        sleep(interval).await;
    }

    let frame = if frames.len() == 1 {
        frames.swap_remove(0)
    } else {
        Frame::average(&frames).map_err(|e| DaqError::device(camera_name, "average frames", e))?
    };
    let elapsed = started.elapsed();
    debug!(camera = camera_name, polls, ?elapsed, averaged = wanted, "Frame captured");

    Ok(CapturedFrame {
        frame,
        polls,
        elapsed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockCamera;

    #[test]
    fn test_poll_interval_bounds() {
        let policy = CapturePolicy::default();
        assert_eq!(
            policy.poll_interval(Duration::from_millis(500)),
            Duration::from_millis(10)
        );
        assert_eq!(
            policy.poll_interval(Duration::from_millis(20)),
            Duration::from_millis(2)
        );
        assert_eq!(
            policy.poll_interval(Duration::from_micros(10)),
            MIN_POLL_INTERVAL
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_waits_for_frame() {
        let camera = MockCamera::new(4, 4).with_empty_polls(2);
        let captured = capture_frame(&camera, "cam1", &CapturePolicy::default())
            .await
            .unwrap();

        assert_eq!(captured.polls, 3);
        assert_eq!(captured.frame.shape(), (4, 4));
        assert!(captured.elapsed >= Duration::from_millis(2));
        assert_eq!(camera.start_count(), 1);
        assert_eq!(camera.stop_count(), 1);
        assert!(!camera.is_acquiring());
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_gives_up_after_max_polls() {
        let camera = MockCamera::new(4, 4).with_empty_polls(1000);
        let policy = CapturePolicy {
            max_polls: Some(5),
            ..CapturePolicy::default()
        };

        let err = capture_frame(&camera, "cam1", &policy).await.unwrap_err();
        assert!(matches!(err, DaqError::CaptureTimeout { polls: 5, .. }));
        assert_eq!(camera.stop_count(), 1, "camera stopped after timeout");
    }

    #[tokio::test(start_paused = true)]
    async fn test_capture_gives_up_after_timeout() {
        let camera = MockCamera::new(4, 4).with_empty_polls(u32::MAX);
        let policy = CapturePolicy {
            timeout: Duration::from_millis(50),
            ..CapturePolicy::default()
        };

        let err = capture_frame(&camera, "cam1", &policy).await.unwrap_err();
        match err {
            DaqError::CaptureTimeout { elapsed, .. } => {
                assert!(elapsed >= Duration::from_millis(50));
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[tokio::test]
    async fn test_capture_averages_frames() {
        let camera = MockCamera::new(2, 2);
        let policy = CapturePolicy {
            average_frames: 3,
            ..CapturePolicy::default()
        };

        let captured = capture_frame(&camera, "cam1", &policy).await.unwrap();
        assert_eq!(camera.frame_count(), 3);
        assert_eq!(captured.polls, 3);
        assert_eq!(captured.frame.shape(), (2, 2));
    }

    #[tokio::test]
    async fn test_device_error_stops_camera() {
        let camera = MockCamera::new(2, 2).fail_on_frame(1);
        let err = capture_frame(&camera, "cam1", &CapturePolicy::default())
            .await
            .unwrap_err();
        assert!(err.is_device_failure());
        assert!(err.to_string().contains("read frame"));
        assert_eq!(camera.stop_count(), 1);
    }
}
