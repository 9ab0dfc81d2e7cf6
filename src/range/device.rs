// range/device.rs

// A range device: a named sensor view of the world backed by a current and a
// cumulative reading buffer. The robot cycle thread feeds it (through its
// fusion policy, or `add_reading`) and filters it once per cycle; planning and
// UI threads query it at any time. One mutex guards everything, and every
// public method holds it for its whole body, so a query never observes a
// buffer mid-eviction or mid-redo.
//
// Queries never fail. Without a robot attached they measure from the origin
// and say so once in the log.

// Dependencies
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crate::core::{Clock, Point2D, Pose2D, RobotState, Timestamp, Transform};
use crate::tasks::{SyncTaskTree, TaskCallback, TaskId, TaskState};

use super::buffer::TimedPoint;
use super::filter::FilterParams;
use super::policy::{CycleContext, DeviceBuffers, SensorFusionPolicy};

/// Construction settings shared by every kind of range device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Device name, unique within a session.
    pub name: String,
    /// Readings farther than this are not reported by queries (mm).
    pub max_range: f64,
    /// Capacity of the current buffer.
    pub current_buffer_size: usize,
    /// Capacity of the cumulative buffer.
    pub cumulative_buffer_size: usize,
    /// Priority of the device's task under the sensor-interpretation branch.
    pub priority: i32,
    /// Age, distance and spacing limits.
    pub filter: FilterParams,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        DeviceSettings {
            name: "range".to_string(),
            max_range: 5000.0,
            current_buffer_size: 100,
            cumulative_buffer_size: 100,
            priority: 50,
            filter: FilterParams::default(),
        }
    }
}

impl DeviceSettings {
    /// Reads a possibly partial settings block over `defaults`. Fields the
    /// block leaves out, nested filter fields included, keep their value from
    /// `defaults`; an explicit `null` on an optional limit disables it.
    ///
    /// Each sensor section deserializes its `device` field through this, so a
    /// block that only changes `max_range` keeps that sensor's name, priority
    /// and filters.
    pub fn deserialize_over<'de, D>(defaults: &DeviceSettings, deserializer: D) -> Result<DeviceSettings, D::Error>
    where
        D: Deserializer<'de>,
    {
        let overlay = Value::deserialize(deserializer)?;
        let mut merged = serde_yaml::to_value(defaults).map_err(D::Error::custom)?;
        if !overlay.is_null() {
            merge_values(&mut merged, overlay);
        }
        serde_yaml::from_value(merged).map_err(D::Error::custom)
    }
}

// Mappings merge key by key; anything else replaces the base value.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Mapping(base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

struct DeviceState {
    max_range: f64,
    buffers: DeviceBuffers,
    policy: Box<dyn SensorFusionPolicy>,
    robot: Option<Arc<dyn RobotState>>,
}

/// Sensor-agnostic range device; the sensor specifics live in its policy.
pub struct RangeDevice {
    name: String,
    priority: i32,
    clock: Arc<dyn Clock>,
    state: Mutex<DeviceState>,
    warned_no_robot: AtomicBool,
}

impl RangeDevice {
    /// Creates a device. Invalid settings are clamped and logged.
    pub fn new(settings: &DeviceSettings, policy: Box<dyn SensorFusionPolicy>, clock: Arc<dyn Clock>) -> Self {
        let max_range = if settings.max_range.is_finite() && settings.max_range > 0.0 {
            settings.max_range
        } else {
            warn!(
                "{}: max_range {} is invalid, using {}",
                settings.name,
                settings.max_range,
                DeviceSettings::default().max_range
            );
            DeviceSettings::default().max_range
        };
        let params = settings.filter.sanitized(&settings.name);
        info!(
            "{}: created {} device (current {}, cumulative {}, max range {} mm)",
            settings.name,
            policy.kind(),
            settings.current_buffer_size,
            settings.cumulative_buffer_size,
            max_range
        );

        RangeDevice {
            name: settings.name.clone(),
            priority: settings.priority,
            clock,
            state: Mutex::new(DeviceState {
                max_range,
                buffers: DeviceBuffers::new(settings.current_buffer_size, settings.cumulative_buffer_size, params),
                policy,
                robot: None,
            }),
            warned_no_robot: AtomicBool::new(false),
        }
    }

    /// Device name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Priority of the device's task.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Short name of the fusion policy, e.g. "sonar".
    pub fn policy_kind(&self) -> &'static str {
        self.state.lock().policy.kind()
    }

    /// Range reported when a query finds nothing (mm).
    pub fn max_range(&self) -> f64 {
        self.state.lock().max_range
    }

    /// Changes the maximum range. Non-positive values are ignored.
    pub fn set_max_range(&self, max_range: f64) {
        if !(max_range.is_finite() && max_range > 0.0) {
            warn!("{}: ignoring invalid max_range {}", self.name, max_range);
            return;
        }
        self.state.lock().max_range = max_range;
    }

    /// Attaches the robot-state provider the device reads its pose from.
    pub fn set_robot(&self, robot: Arc<dyn RobotState>) {
        self.state.lock().robot = Some(robot);
        self.warned_no_robot.store(false, Ordering::Relaxed);
    }

    /// True once a robot-state provider is attached.
    pub fn has_robot(&self) -> bool {
        self.state.lock().robot.is_some()
    }

    /// The filter settings in force.
    pub fn filter_params(&self) -> FilterParams {
        *self.state.lock().buffers.params()
    }

    /// Replaces the filter settings, clamping invalid values.
    pub fn set_filter_params(&self, params: FilterParams) {
        let params = params.sanitized(&self.name);
        self.state.lock().buffers.set_params(params);
    }

    /// Capacity of the current buffer.
    pub fn current_buffer_size(&self) -> usize {
        self.state.lock().buffers.current().capacity()
    }

    /// Resizes the current buffer, dropping the oldest readings if it shrinks.
    pub fn set_current_buffer_size(&self, size: usize) {
        self.state.lock().buffers.current_mut().set_capacity(size);
    }

    /// Capacity of the cumulative buffer.
    pub fn cumulative_buffer_size(&self) -> usize {
        self.state.lock().buffers.cumulative().capacity()
    }

    /// Resizes the cumulative buffer, dropping the oldest readings if it shrinks.
    pub fn set_cumulative_buffer_size(&self, size: usize) {
        self.state.lock().buffers.cumulative_mut().set_capacity(size);
    }

    /// Readings in the current buffer.
    pub fn current_len(&self) -> usize {
        self.state.lock().buffers.current().len()
    }

    /// Readings in the cumulative buffer.
    pub fn cumulative_len(&self) -> usize {
        self.state.lock().buffers.cumulative().len()
    }

    /// Copy of the current buffer, oldest first.
    pub fn current_snapshot(&self) -> Vec<TimedPoint> {
        self.state.lock().buffers.current().snapshot()
    }

    /// Copy of the cumulative buffer, oldest first.
    pub fn cumulative_snapshot(&self) -> Vec<TimedPoint> {
        self.state.lock().buffers.cumulative().snapshot()
    }

    /// Empties the current buffer.
    pub fn clear_current_readings(&self) {
        self.state.lock().buffers.current_mut().clear();
    }

    /// Empties the cumulative buffer.
    pub fn clear_cumulative_readings(&self) {
        self.state.lock().buffers.cumulative_mut().clear();
    }

    /// Drops cumulative readings at least `seconds` old.
    pub fn clear_cumulative_older_than(&self, seconds: f64) -> usize {
        let now = self.clock.now();
        self.state
            .lock()
            .buffers
            .cumulative_mut()
            .invalidate_where(|p| now.seconds_since(p.time) >= seconds)
    }

    /// Adds a global-frame reading. Returns whether the current buffer took it.
    pub fn add_reading(&self, x: f64, y: f64) -> bool {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let pose = self.robot_pose(&state);
        state.buffers.add_reading(x, y, &pose, now)
    }

    /// Replaces the current buffer through the redo protocol in one critical
    /// section.
    pub fn replace_current<I>(&self, points: I)
    where
        I: IntoIterator<Item = Point2D>,
    {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let current = state.buffers.current_mut();
        current.begin_redo();
        for p in points {
            current.redo_reading(p.x, p.y, now);
        }
        current.end_redo();
    }

    /// Age and distance eviction for this cycle.
    pub fn filter_cycle(&self, robot_pose: &Pose2D, now: Timestamp) {
        let (current, cumulative) = self.state.lock().buffers.filter(robot_pose, now);
        if current > 0 || cumulative > 0 {
            debug!(
                "{}: filtered {} current and {} cumulative readings",
                self.name, current, cumulative
            );
        }
    }

    /// One sensor-interpretation cycle: run the policy, then filter.
    pub fn process_readings(&self) {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let Some(robot) = state.robot.clone() else {
            debug!("{}: no robot attached, skipping cycle", self.name);
            return;
        };
        let ctx = CycleContext {
            pose: robot.pose(),
            robot_radius: robot.robot_radius(),
            counter: robot.counter(),
            now,
            max_range: state.max_range,
            robot: robot.as_ref(),
        };
        let DeviceState { buffers, policy, .. } = &mut *state;
        policy.process(buffers, &ctx);
        let (current, cumulative) = buffers.filter(&ctx.pose, now);
        if current > 0 || cumulative > 0 {
            debug!(
                "{}: filtered {} current and {} cumulative readings",
                self.name, current, cumulative
            );
        }
    }

    /// Closest current reading on the arc from `start` to `end` degrees
    /// (robot-relative, counter-clockwise). `max_range` means nothing found.
    pub fn closest_reading_polar(&self, start: f64, end: f64) -> f64 {
        self.closest_reading_polar_with_angle(start, end).0
    }

    /// As [`closest_reading_polar`](Self::closest_reading_polar), also returning the robot-relative bearing of the hit.
    pub fn closest_reading_polar_with_angle(&self, start: f64, end: f64) -> (f64, Option<f64>) {
        let state = self.state.lock();
        let pose = self.robot_pose(&state);
        state
            .buffers
            .current()
            .closest_polar_with_angle(start, end, &pose, state.max_range)
    }

    /// Closest current reading inside a robot-frame box.
    pub fn closest_reading_box(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
        self.closest_reading_box_with_point(x1, y1, x2, y2).0
    }

    /// As [`closest_reading_box`](Self::closest_reading_box), also returning the global position of the hit.
    pub fn closest_reading_box_with_point(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> (f64, Option<Point2D>) {
        let state = self.state.lock();
        let pose = self.robot_pose(&state);
        state
            .buffers
            .current()
            .closest_box_with_point(x1, y1, x2, y2, &pose, state.max_range)
    }

    /// As [`closest_reading_polar`](Self::closest_reading_polar) over the
    /// cumulative buffer.
    pub fn cumulative_reading_polar(&self, start: f64, end: f64) -> f64 {
        self.cumulative_reading_polar_with_angle(start, end).0
    }

    /// As [`cumulative_reading_polar`](Self::cumulative_reading_polar), also returning the bearing of the hit.
    pub fn cumulative_reading_polar_with_angle(&self, start: f64, end: f64) -> (f64, Option<f64>) {
        let state = self.state.lock();
        let pose = self.robot_pose(&state);
        state
            .buffers
            .cumulative()
            .closest_polar_with_angle(start, end, &pose, state.max_range)
    }

    /// As [`closest_reading_box`](Self::closest_reading_box) over the cumulative buffer.
    pub fn cumulative_reading_box(&self, x1: f64, y1: f64, x2: f64, y2: f64) -> f64 {
        self.cumulative_reading_box_with_point(x1, y1, x2, y2).0
    }

    /// As [`cumulative_reading_box`](Self::cumulative_reading_box), also returning the global position of the hit.
    pub fn cumulative_reading_box_with_point(
        &self,
        x1: f64,
        y1: f64,
        x2: f64,
        y2: f64,
    ) -> (f64, Option<Point2D>) {
        let state = self.state.lock();
        let pose = self.robot_pose(&state);
        state
            .buffers
            .cumulative()
            .closest_box_with_point(x1, y1, x2, y2, &pose, state.max_range)
    }

    /// Moves the current readings (and optionally the cumulative ones) through
    /// `transform`, e.g. after a localisation correction.
    pub fn apply_transform(&self, transform: &Transform, also_cumulative: bool) {
        let mut state = self.state.lock();
        state.buffers.current_mut().apply_transform(transform);
        if also_cumulative {
            state.buffers.cumulative_mut().apply_transform(transform);
        }
    }

    /// Callback suitable for a scheduler leaf. Holds the device weakly so the
    /// task tree never keeps a removed device alive.
    pub fn sensor_task(self: &Arc<Self>) -> TaskCallback {
        let device: Weak<RangeDevice> = Arc::downgrade(self);
        Arc::new(move || {
            if let Some(device) = device.upgrade() {
                device.process_readings();
            }
        })
    }

    /// Adds the device's leaf under `parent`, named after the device.
    pub fn register_with(self: &Arc<Self>, tree: &mut SyncTaskTree, parent: TaskId) -> Option<TaskId> {
        tree.add_new_leaf(parent, &self.name, self.priority, self.sensor_task(), TaskState::Init)
    }

    fn robot_pose(&self, state: &DeviceState) -> Pose2D {
        match &state.robot {
            Some(robot) => robot.pose(),
            None => {
                if !self.warned_no_robot.swap(true, Ordering::Relaxed) {
                    error!("{}: used before a robot was attached, measuring from the origin", self.name);
                }
                Pose2D::origin()
            }
        }
    }
}

impl std::fmt::Debug for RangeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RangeDevice")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::robot::MockRobotState;
    use crate::core::ManualClock;
    use crate::range::policy::PassivePolicy;
    use approx::assert_relative_eq;

    fn device(settings: DeviceSettings) -> (RangeDevice, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let device = RangeDevice::new(&settings, Box::new(PassivePolicy), clock.clone());
        (device, clock)
    }

    fn robot_at(pose: Pose2D) -> Arc<MockRobotState> {
        let mut robot = MockRobotState::new();
        robot.expect_pose().return_const(pose);
        robot.expect_robot_radius().return_const(250.0);
        robot.expect_counter().return_const(1u64);
        Arc::new(robot)
    }

    #[test]
    fn test_queries_without_robot_use_origin() {
        let (device, _) = device(DeviceSettings::default());
        device.add_reading(1000.0, 0.0);
        assert_relative_eq!(device.closest_reading_polar(-10.0, 10.0), 1000.0);
        assert_relative_eq!(device.closest_reading_box(0.0, -10.0, 2000.0, 10.0), 1000.0);
        assert_eq!(device.cumulative_reading_polar(90.0, 100.0), 5000.0);
    }

    #[test]
    fn test_process_without_robot_is_a_no_op() {
        let (device, _) = device(DeviceSettings::default());
        device.add_reading(10.0, 0.0);
        device.process_readings();
        assert_eq!(device.current_len(), 1);
    }

    #[test]
    fn test_invalid_max_range_is_clamped() {
        let settings = DeviceSettings {
            max_range: -1.0,
            ..DeviceSettings::default()
        };
        let (device, _) = device(settings);
        assert_eq!(device.max_range(), 5000.0);
        device.set_max_range(f64::NAN);
        assert_eq!(device.max_range(), 5000.0);
        device.set_max_range(3000.0);
        assert_eq!(device.max_range(), 3000.0);
    }

    #[test]
    fn test_queries_measure_from_robot_pose() {
        let (device, _) = device(DeviceSettings::default());
        device.set_robot(robot_at(Pose2D::new(500.0, 0.0, 180.0)));
        device.add_reading(0.0, 0.0);
        // The reading is straight ahead of a robot facing back towards it.
        let (range, angle) = device.closest_reading_polar_with_angle(-5.0, 5.0);
        assert_relative_eq!(range, 500.0, epsilon = 1e-9);
        assert_relative_eq!(angle.unwrap(), 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_apply_transform_optionally_moves_cumulative() {
        let (device, _) = device(DeviceSettings::default());
        device.add_reading(100.0, 0.0);
        let shift = Transform::new(Pose2D::new(50.0, 0.0, 0.0));

        device.apply_transform(&shift, false);
        assert_relative_eq!(device.current_snapshot()[0].x, 150.0);
        assert_relative_eq!(device.cumulative_snapshot()[0].x, 100.0);

        device.apply_transform(&shift, true);
        assert_relative_eq!(device.current_snapshot()[0].x, 200.0);
        assert_relative_eq!(device.cumulative_snapshot()[0].x, 150.0);
    }

    #[test]
    fn test_clear_cumulative_older_than() {
        let (device, clock) = device(DeviceSettings::default());
        device.add_reading(100.0, 0.0);
        clock.advance(std::time::Duration::from_secs(5));
        device.add_reading(500.0, 0.0);
        assert_eq!(device.clear_cumulative_older_than(3.0), 1);
        assert_eq!(device.cumulative_len(), 1);
        assert_eq!(device.current_len(), 2);
    }

    #[test]
    fn test_sensor_task_does_not_keep_device_alive() {
        let (device, _) = device(DeviceSettings::default());
        let device = Arc::new(device);
        let task = device.sensor_task();
        drop(device);
        // Runs without a device to upgrade to.
        task();
    }
}
