// core/robot.rs

// The robot-state provider consumed by the range devices: a fast, locked
// snapshot of pose, physical radius and the per-cycle packet counter, plus a
// short pose history so readings taken slightly in the past can be placed
// where the robot actually was when they were sampled.

// Dependencies
use log::debug;
use parking_lot::RwLock;
use std::collections::VecDeque;

use super::geometry::{add_angle, sub_angle, Pose2D};
use super::time::Timestamp;

/// Read-only view of the robot that range devices need.
///
/// Implementations must answer from any thread without blocking for long;
/// a locked snapshot read is the expected shape.
#[cfg_attr(test, mockall::automock)]
pub trait RobotState: Send + Sync {
    /// Current pose in the global (odometry) frame.
    fn pose(&self) -> Pose2D;

    /// Physical radius in millimetres.
    fn robot_radius(&self) -> f64;

    /// Monotonic per-cycle counter used to tell new samples from old ones.
    fn counter(&self) -> u64;

    /// Pose at a past instant, when known.
    fn pose_at(&self, _time: Timestamp) -> Option<Pose2D> {
        None
    }
}

/// Bounded history of timestamped poses with linear interpolation.
#[derive(Debug, Clone)]
pub struct PoseHistory {
    entries: VecDeque<(Timestamp, Pose2D)>,
    capacity: usize,
}

impl PoseHistory {
    /// Creates an empty history keeping up to `capacity` poses.
    pub fn new(capacity: usize) -> Self {
        PoseHistory {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Records a pose. Out-of-order samples are dropped.
    pub fn push(&mut self, time: Timestamp, pose: Pose2D) {
        if self.capacity == 0 {
            return;
        }
        if let Some((last, _)) = self.entries.back() {
            if time < *last {
                debug!("Dropping out-of-order pose sample at {} ms", time.as_millis());
                return;
            }
        }
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((time, pose));
    }

    /// Number of recorded poses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no pose has been recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every recorded pose.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Interpolated pose at `time`; `None` outside the recorded span.
    pub fn pose_at(&self, time: Timestamp) -> Option<Pose2D> {
        let (first_t, first_p) = *self.entries.front()?;
        let (last_t, last_p) = *self.entries.back()?;
        if time < first_t || time > last_t {
            return None;
        }
        if time == last_t {
            return Some(last_p);
        }
        if time == first_t {
            return Some(first_p);
        }

        // First entry at or after `time`; entries are sorted by time.
        let idx = self.entries.partition_point(|(t, _)| *t < time);
        let (t1, p1) = self.entries[idx];
        if t1 == time || idx == 0 {
            return Some(p1);
        }
        let (t0, p0) = self.entries[idx - 1];
        let span = t1.millis_since(t0) as f64;
        if span <= 0.0 {
            return Some(p1);
        }
        let f = time.millis_since(t0) as f64 / span;
        Some(Pose2D::new(
            p0.x + (p1.x - p0.x) * f,
            p0.y + (p1.y - p0.y) * f,
            add_angle(p0.th, sub_angle(p1.th, p0.th) * f),
        ))
    }
}

#[derive(Debug)]
struct Snapshot {
    pose: Pose2D,
    radius: f64,
    counter: u64,
    history: PoseHistory,
}

/// Thread-safe robot state updated by the robot I/O side and read by devices.
#[derive(Debug)]
pub struct SharedRobotState {
    inner: RwLock<Snapshot>,
}

impl SharedRobotState {
    /// Creates a state at the origin with counter 0.
    pub fn new(radius: f64, history_size: usize) -> Self {
        SharedRobotState {
            inner: RwLock::new(Snapshot {
                pose: Pose2D::origin(),
                radius,
                counter: 0,
                history: PoseHistory::new(history_size),
            }),
        }
    }

    /// Sets the current pose and records it in the history.
    pub fn set_pose(&self, pose: Pose2D, time: Timestamp) {
        let mut inner = self.inner.write();
        inner.pose = pose;
        inner.history.push(time, pose);
    }

    /// Changes the robot radius (mm).
    pub fn set_radius(&self, radius: f64) {
        self.inner.write().radius = radius;
    }

    /// Advances the packet counter, returning the new value.
    pub fn increment_counter(&self) -> u64 {
        let mut inner = self.inner.write();
        inner.counter = inner.counter.wrapping_add(1);
        inner.counter
    }
}

impl RobotState for SharedRobotState {
    fn pose(&self) -> Pose2D {
        self.inner.read().pose
    }

    fn robot_radius(&self) -> f64 {
        self.inner.read().radius
    }

    fn counter(&self) -> u64 {
        self.inner.read().counter
    }

    fn pose_at(&self, time: Timestamp) -> Option<Pose2D> {
        self.inner.read().history.pose_at(time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_history_interpolates() {
        let mut history = PoseHistory::new(10);
        history.push(Timestamp::from_millis(0), Pose2D::new(0.0, 0.0, 170.0));
        history.push(Timestamp::from_millis(100), Pose2D::new(100.0, 0.0, -170.0));

        let mid = history.pose_at(Timestamp::from_millis(50)).unwrap();
        assert_relative_eq!(mid.x, 50.0, epsilon = 1e-9);
        // Shortest way round from 170 to -170 passes through 180.
        assert_relative_eq!(mid.th, 180.0, epsilon = 1e-9);

        assert!(history.pose_at(Timestamp::from_millis(101)).is_none());
    }

    #[test]
    fn test_history_is_bounded() {
        let mut history = PoseHistory::new(2);
        for i in 0..5 {
            history.push(Timestamp::from_millis(i * 10), Pose2D::new(i as f64, 0.0, 0.0));
        }
        assert_eq!(history.len(), 2);
        assert!(history.pose_at(Timestamp::from_millis(0)).is_none());
        assert!(history.pose_at(Timestamp::from_millis(35)).is_some());
    }

    #[test]
    fn test_shared_state_counter() {
        let state = SharedRobotState::new(250.0, 16);
        assert_eq!(state.counter(), 0);
        assert_eq!(state.increment_counter(), 1);
        assert_eq!(state.counter(), 1);
        assert_eq!(state.robot_radius(), 250.0);
    }
}
