//! Hardware Layer
//!
//! Capability traits the sequencer drives, the frame type they produce, simulated
//! devices and the named registry controllers resolve devices from.

pub mod capabilities;
pub mod frame;
pub mod mock;
pub mod registry;

pub use capabilities::{Axis, FrameSource, StagePositioner};
pub use frame::{Frame, FrameDescriptor};
pub use registry::DeviceRegistry;
