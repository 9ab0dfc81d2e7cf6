// core/mod.rs

// Declares the building blocks every other module leans on: planar geometry,
// timestamps and clocks, and the robot-state provider the range devices read
// their pose from.

/// Points, poses, transforms and angle helpers.
pub mod geometry;
/// Robot state shared with range devices.
pub mod robot;
/// Timestamps and clocks.
pub mod time;

// Re-export key types for a unified API
pub use geometry::{add_angle, angle_between, fix_angle, sub_angle, LineSegment, Point2D, Pose2D, Transform};
pub use robot::{PoseHistory, RobotState, SharedRobotState};
pub use time::{Clock, ManualClock, MonotonicClock, Timestamp};
