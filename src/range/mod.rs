//! Range devices
//!
//! Buffered, thread-safe views of what the robot's range sensors have seen:
//! the timestamped reading buffers, the filtering policy applied to them, the
//! device that owns them, and the fusion-policy seam sensor strategies plug
//! into.

/// Bounded reading buffers.
pub mod buffer;
/// The lockable range device.
pub mod device;
/// Age, distance and spacing limits.
pub mod filter;
/// The fusion-policy seam and the buffers it works on.
pub mod policy;

pub use buffer::{RangeBuffer, TimedPoint};
pub use device::{DeviceSettings, RangeDevice};
pub use filter::{FilterParams, SquaredLimits};
pub use policy::{CycleContext, DeviceBuffers, PassivePolicy, SensorFusionPolicy};
