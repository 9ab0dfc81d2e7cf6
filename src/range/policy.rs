// range/policy.rs

// The seam between a range device and the sensor it interprets. A device owns
// one boxed `SensorFusionPolicy`; once per cycle the device locks itself and
// hands the policy its buffers together with a snapshot of the robot. Policies
// turn raw samples into buffer insertions and never see the device lock.

// Dependencies
use crate::core::{Pose2D, RobotState, Timestamp};

use super::buffer::RangeBuffer;
use super::filter::{FilterParams, SquaredLimits};

/// What a policy may read about the robot during one cycle.
pub struct CycleContext<'a> {
    /// Robot pose at the start of the cycle.
    pub pose: Pose2D,
    /// Robot radius (mm).
    pub robot_radius: f64,
    /// Robot counter for this cycle; samples stamped with it are new.
    pub counter: u64,
    /// Clock reading for this cycle.
    pub now: Timestamp,
    /// Maximum range of the owning device.
    pub max_range: f64,
    /// The provider itself, for pose-at-time lookups.
    pub robot: &'a dyn RobotState,
}

/// The two buffers of a device plus its filter settings.
#[derive(Debug, Clone)]
pub struct DeviceBuffers {
    current: RangeBuffer,
    cumulative: RangeBuffer,
    params: FilterParams,
    squared: SquaredLimits,
}

impl DeviceBuffers {
    /// Empty buffers of the given sizes.
    pub fn new(current_size: usize, cumulative_size: usize, params: FilterParams) -> Self {
        DeviceBuffers {
            current: RangeBuffer::new(current_size),
            cumulative: RangeBuffer::new(cumulative_size),
            squared: params.squared(),
            params,
        }
    }

    /// The current buffer.
    pub fn current(&self) -> &RangeBuffer {
        &self.current
    }

    /// The current buffer, mutably.
    pub fn current_mut(&mut self) -> &mut RangeBuffer {
        &mut self.current
    }

    /// The cumulative buffer.
    pub fn cumulative(&self) -> &RangeBuffer {
        &self.cumulative
    }

    /// The cumulative buffer, mutably.
    pub fn cumulative_mut(&mut self) -> &mut RangeBuffer {
        &mut self.cumulative
    }

    /// Filter settings as configured.
    pub fn params(&self) -> &FilterParams {
        &self.params
    }

    /// Filter distances pre-squared.
    pub fn squared(&self) -> &SquaredLimits {
        &self.squared
    }

    /// Installs already-sanitized params.
    pub(crate) fn set_params(&mut self, params: FilterParams) {
        self.squared = params.squared();
        self.params = params;
    }

    /// Adds a reading to the current buffer (subject to its spacing limit) and
    /// to the cumulative buffer when it is close enough to `robot_pose`.
    /// Returns whether the current buffer took it.
    pub fn add_reading(&mut self, x: f64, y: f64, robot_pose: &Pose2D, now: Timestamp) -> bool {
        let added = self.add_current(x, y, now);
        self.add_cumulative(x, y, robot_pose, now);
        added
    }

    /// The current half of [`add_reading`](Self::add_reading).
    pub fn add_current(&mut self, x: f64, y: f64, now: Timestamp) -> bool {
        self.current
            .add_conditional(x, y, self.squared.min_dist_between_current, now)
    }

    /// The cumulative half of [`add_reading`](Self::add_reading).
    pub fn add_cumulative(&mut self, x: f64, y: f64, robot_pose: &Pose2D, now: Timestamp) -> bool {
        if let Some(max_sq) = self.squared.max_insert_dist_cumulative {
            let dx = x - robot_pose.x;
            let dy = y - robot_pose.y;
            if dx * dx + dy * dy > max_sq {
                return false;
            }
        }
        self.cumulative
            .add_conditional(x, y, self.squared.min_dist_between_cumulative, now)
    }

    /// Age eviction on both buffers and distance eviction on the cumulative
    /// one, relative to `robot_pose`. Returns `(current, cumulative)` removal
    /// counts.
    pub fn filter(&mut self, robot_pose: &Pose2D, now: Timestamp) -> (usize, usize) {
        let mut removed_current = 0;
        if let Some(max_secs) = self.params.max_seconds_current {
            if !self.current.is_empty() {
                removed_current = self
                    .current
                    .invalidate_where(|p| now.seconds_since(p.time) >= max_secs);
            }
        }

        let mut removed_cumulative = 0;
        let max_secs = self.params.max_seconds_cumulative;
        let max_dist_sq = self.squared.max_dist_cumulative;
        if (max_secs.is_some() || max_dist_sq.is_some()) && !self.cumulative.is_empty() {
            let (rx, ry) = (robot_pose.x, robot_pose.y);
            removed_cumulative = self.cumulative.invalidate_where(|p| {
                max_secs.map_or(false, |s| now.seconds_since(p.time) >= s)
                    || max_dist_sq.map_or(false, |d| p.squared_distance_to(rx, ry) > d)
            });
        }
        (removed_current, removed_cumulative)
    }
}

/// Per-sensor strategy that feeds a range device.
pub trait SensorFusionPolicy: Send {
    /// Short label used in logs.
    fn kind(&self) -> &'static str;

    /// Pulls whatever is new from the sensor and inserts it. Called with the
    /// device lock held, once per cycle, before filtering.
    fn process(&mut self, buffers: &mut DeviceBuffers, ctx: &CycleContext<'_>);
}

/// Policy for devices fed only through `RangeDevice::add_reading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassivePolicy;

impl SensorFusionPolicy for PassivePolicy {
    fn kind(&self) -> &'static str {
        "passive"
    }

    fn process(&mut self, _buffers: &mut DeviceBuffers, _ctx: &CycleContext<'_>) {}
}
