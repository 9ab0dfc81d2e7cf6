//! mvr - range-device fusion core for a mobile robot
//!
//! This library keeps thread-safe, time-bounded views of what a robot's range
//! sensors (sonar, bumpers, scanning laser, map forbidden zones) have seen, and
//! drives their interpretation from a cooperative per-cycle task tree tied to
//! the robot's odometry updates.
//!
//! Distances are millimetres, angles are degrees in (-180, 180], ages are
//! seconds.

#![warn(missing_docs)]
#![warn(unused_extern_crates)]

pub mod config;
/// Geometry, time and robot state.
pub mod core;
pub mod error;
pub mod map;
pub mod range;
pub mod sensors;
/// The per-robot cycle driver.
pub mod session;
pub mod tasks;

// Re-export commonly used items for easier access
pub use crate::config::MvrConfig;
pub use crate::core::{Clock, ManualClock, MonotonicClock, Point2D, Pose2D, RobotState, SharedRobotState, Timestamp, Transform};
pub use crate::error::{MvrError, Result};
pub use crate::map::{InMemoryMap, MapObject, MapSource};
pub use crate::range::{DeviceSettings, FilterParams, RangeBuffer, RangeDevice, SensorFusionPolicy};
pub use crate::session::{RobotSession, SessionConfig, SessionHandle};
pub use crate::tasks::{SyncTaskTree, TaskCallback, TaskId, TaskState};
