//! Image frames produced by [`FrameSource`](super::capabilities::FrameSource) devices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single monochrome camera frame.
///
/// Pixels are stored row-major as 16-bit values regardless of the sensor's native
/// bit depth. A frame with zero pixels is the "not ready yet" sentinel some drivers
/// return instead of `None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    width: u32,
    height: u32,
    data: Vec<u16>,
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Create a frame from a pixel buffer.
    ///
    /// # Errors
    ///
    /// Fails when `data.len() != width * height`.
    pub fn new(width: u32, height: u32, data: Vec<u16>) -> anyhow::Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            anyhow::bail!(
                "Frame buffer holds {} pixels, expected {}x{} = {}",
                data.len(),
                width,
                height,
                expected
            );
        }
        Ok(Self {
            width,
            height,
            data,
            captured_at: Utc::now(),
        })
    }

    /// Zero-sized frame.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            width: 0,
            height: 0,
            data: Vec::new(),
            captured_at: Utc::now(),
        }
    }

    /// Frame width in pixels.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// `(width, height)`.
    #[must_use]
    pub fn shape(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Raw pixels, row-major.
    #[must_use]
    pub fn pixels(&self) -> &[u16] {
        &self.data
    }

    /// Wall-clock time the frame was handed out by the driver.
    #[must_use]
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// True when the frame carries no pixels.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Size of the pixel buffer in bytes.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.data.len() * std::mem::size_of::<u16>()
    }

    /// Pixel buffer as little-endian bytes, as written by the file sink.
    #[must_use]
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|px| px.to_le_bytes()).collect()
    }

    /// Descriptor used when reserving storage for frames of this shape.
    #[must_use]
    pub fn descriptor(&self) -> FrameDescriptor {
        FrameDescriptor::mono16(self.width, self.height)
    }

    /// Per-pixel mean of several frames of identical shape.
    ///
    /// # Errors
    ///
    /// Fails on an empty slice or when shapes differ.
    pub fn average(frames: &[Frame]) -> anyhow::Result<Frame> {
        let Some(first) = frames.first() else {
            anyhow::bail!("Cannot average zero frames");
        };
        if frames.len() == 1 {
            return Ok(first.clone());
        }
        let mut sum = vec![0u64; first.data.len()];
        for frame in frames {
            if frame.shape() != first.shape() {
                anyhow::bail!(
                    "Cannot average frames of different shapes: {:?} vs {:?}",
                    first.shape(),
                    frame.shape()
                );
            }
            for (acc, px) in sum.iter_mut().zip(&frame.data) {
                *acc += u64::from(*px);
            }
        }
        let count = frames.len() as u64;
        let data = sum.into_iter().map(|acc| (acc / count) as u16).collect();
        Frame::new(first.width, first.height, data)
    }
}

/// Sample descriptor for one named frame stream in a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameDescriptor {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Bytes per pixel on disk
    pub bytes_per_pixel: u8,
}

impl FrameDescriptor {
    /// Descriptor for 16-bit monochrome frames.
    #[must_use]
    pub fn mono16(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            bytes_per_pixel: 2,
        }
    }

    /// Bytes one frame occupies on disk.
    #[must_use]
    pub fn frame_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * u64::from(self.bytes_per_pixel)
    }

    /// True when `frame` can be stored under this descriptor.
    #[must_use]
    pub fn matches(&self, frame: &Frame) -> bool {
        frame.shape() == (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_mismatched_buffer() {
        assert!(Frame::new(4, 4, vec![0; 15]).is_err());
        assert!(Frame::new(4, 4, vec![0; 16]).is_ok());
    }

    #[test]
    fn test_empty_frame_is_sentinel() {
        assert!(Frame::empty().is_empty());
        assert!(!Frame::new(1, 1, vec![7]).unwrap().is_empty());
    }

    #[test]
    fn test_average_uses_integer_mean() {
        let a = Frame::new(2, 1, vec![10, 100]).unwrap();
        let b = Frame::new(2, 1, vec![20, 101]).unwrap();
        let avg = Frame::average(&[a, b]).unwrap();
        assert_eq!(avg.pixels(), &[15, 100]);
    }

    #[test]
    fn test_average_rejects_shape_mismatch() {
        let a = Frame::new(2, 1, vec![1, 2]).unwrap();
        let b = Frame::new(1, 2, vec![1, 2]).unwrap();
        assert!(Frame::average(&[a, b]).is_err());
        assert!(Frame::average(&[]).is_err());
    }

    #[test]
    fn test_le_bytes_layout() {
        let frame = Frame::new(2, 1, vec![0x0102, 0xA0B0]).unwrap();
        assert_eq!(frame.to_le_bytes(), vec![0x02, 0x01, 0xB0, 0xA0]);
        assert_eq!(frame.byte_len(), 4);
        assert_eq!(frame.descriptor().frame_bytes(), 4);
    }
}
