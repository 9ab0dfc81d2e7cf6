// sensors/laser.rs

// Scanning laser interpretation. A scan is a full sweep of beams; each new
// scan replaces the current buffer wholesale through the redo protocol. The
// cumulative buffer keeps obstacles between scans and is kept honest with
// line-of-sight cleaning: a beam that passes cleanly through a remembered
// point proves that point is gone. Cleaning is the expensive part, so it runs
// at most once per `clean_interval` seconds.
//
// Beams can be ignored for three reasons: they fall in a blind angular range,
// they returned nothing within max range, or the device flagged an error.
// Ignored beams never become obstacles but still clean along their whole
// length, which is how a "no return" wipes out stale points in front of it.

// Dependencies
use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use crate::core::{angle_between, Clock, LineSegment, Point2D, Pose2D, Timestamp, Transform};
use crate::range::{CycleContext, DeviceBuffers, DeviceSettings, FilterParams, RangeDevice, SensorFusionPolicy};

/// Inclusive counter-clockwise arc of beam bearings, degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AngleRange {
    /// First bearing of the arc (degrees).
    pub start: f64,
    /// Last bearing of the arc (degrees).
    pub end: f64,
}

impl AngleRange {
    /// True when `angle` lies on the arc.
    pub fn contains(&self, angle: f64) -> bool {
        angle_between(angle, self.start, self.end)
    }
}

/// One beam: range and bearing in the sensor frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaserBeam {
    /// Measured range (mm).
    pub range: f64,
    /// Bearing in the sensor frame (degrees).
    pub bearing: f64,
}

/// A full sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct LaserScan {
    /// Robot counter of the cycle the scan arrived on.
    pub counter: u64,
    /// When the sweep was taken, if the driver knows.
    pub time: Option<Timestamp>,
    /// Sensor mounting pose in the robot frame.
    pub sensor: Pose2D,
    /// Beams in sweep order.
    pub beams: Vec<LaserBeam>,
    /// Set by the driver when the whole sweep is untrustworthy.
    pub error: bool,
}

/// A beam projected into the robot frame with its ignore decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawReading {
    /// End point in the robot frame.
    pub local: Point2D,
    /// Range after clamping to max range.
    pub range: f64,
    /// Bearing in the robot frame (degrees).
    pub bearing: f64,
    /// True when the beam must not become a reading.
    pub ignore: bool,
}

impl LaserScan {
    /// Projects every beam into the robot frame. Beams past `max_range` are
    /// clamped to it and flagged ignored, as are beams inside `blind` and all
    /// beams of an errored scan.
    pub fn raw_readings(&self, max_range: f64, blind: &[AngleRange]) -> Vec<RawReading> {
        let to_robot = Transform::new(self.sensor);
        self.beams
            .iter()
            .map(|beam| {
                let mut ignore = self.error || blind.iter().any(|r| r.contains(beam.bearing));
                let mut range = beam.range;
                if range.is_nan() || range > max_range {
                    range = max_range;
                    ignore = true;
                }
                let th = beam.bearing.to_radians();
                let local = to_robot.do_transform(&Point2D::new(range * th.cos(), range * th.sin()));
                RawReading {
                    local,
                    range,
                    bearing: beam.bearing,
                    ignore,
                }
            })
            .collect()
    }
}

/// Supplies the most recent scan.
#[cfg_attr(test, mockall::automock)]
pub trait LaserSource: Send + Sync {
    /// The newest scan, if any has arrived.
    fn latest_scan(&self) -> Option<LaserScan>;
}

/// Mailbox holding the newest scan, written by the laser driver thread.
#[derive(Debug, Default)]
pub struct LatestScan {
    scan: Mutex<Option<LaserScan>>,
}

impl LatestScan {
    /// An empty mailbox.
    pub fn new() -> Self {
        LatestScan::default()
    }

    /// Replaces the held scan.
    pub fn publish(&self, scan: LaserScan) {
        *self.scan.lock() = Some(scan);
    }

    /// Drops the held scan.
    pub fn clear(&self) {
        *self.scan.lock() = None;
    }
}

impl LaserSource for LatestScan {
    fn latest_scan(&self) -> Option<LaserScan> {
        self.scan.lock().clone()
    }
}

/// Settings of a laser device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaserSettings {
    /// Device settings; a partial block keeps the laser defaults.
    #[serde(deserialize_with = "laser_device_settings")]
    pub device: DeviceSettings,
    /// Cleaning corridor half-width around each beam (mm); 0 disables
    /// cleaning.
    pub clean_dist: f64,
    /// Minimum time between cleaning passes (seconds).
    pub clean_interval: f64,
    /// Bearings whose beams are always ignored.
    pub blind_ranges: Vec<AngleRange>,
}

impl Default for LaserSettings {
    fn default() -> Self {
        LaserSettings {
            device: DeviceSettings {
                name: "laser".to_string(),
                max_range: 8000.0,
                current_buffer_size: 361,
                cumulative_buffer_size: 1000,
                priority: 90,
                filter: FilterParams {
                    max_seconds_cumulative: Some(30.0),
                    max_dist_cumulative: Some(6000.0),
                    min_dist_between_cumulative: 20.0,
                    max_insert_dist_cumulative: Some(3000.0),
                    ..FilterParams::default()
                },
            },
            clean_dist: 75.0,
            clean_interval: 1.0,
            blind_ranges: Vec::new(),
        }
    }
}

fn laser_device_settings<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DeviceSettings, D::Error> {
    DeviceSettings::deserialize_over(&LaserSettings::default().device, deserializer)
}

/// Fusion policy for a scanning laser.
pub struct LaserPolicy {
    source: Arc<dyn LaserSource>,
    clean_dist: f64,
    clean_interval: f64,
    blind_ranges: Vec<AngleRange>,
    last_counter: Option<u64>,
    last_clean: Option<Timestamp>,
}

impl LaserPolicy {
    /// Policy reading scans from `source`.
    pub fn new(source: Arc<dyn LaserSource>, settings: &LaserSettings) -> Self {
        LaserPolicy {
            source,
            clean_dist: settings.clean_dist.max(0.0),
            clean_interval: settings.clean_interval.max(0.0),
            blind_ranges: settings.blind_ranges.clone(),
            last_counter: None,
            last_clean: None,
        }
    }

    fn clean_due(&self, now: Timestamp) -> bool {
        self.clean_dist > 0.0
            && self
                .last_clean
                .map_or(true, |last| now.seconds_since(last) >= self.clean_interval)
    }

    /// Invalidates cumulative points that a beam passed through.
    fn clean_line_of_sight(&self, buffers: &mut DeviceBuffers, sensor: Point2D, readings: &[(Point2D, bool)]) -> usize {
        let clean_dist = self.clean_dist;
        let clean_sq = clean_dist * clean_dist;
        let beams: Vec<(LineSegment, Point2D, bool)> = readings
            .iter()
            .map(|(p, ignore)| (LineSegment::new(sensor, *p), *p, *ignore))
            .collect();
        buffers.cumulative_mut().invalidate_where(|tp| {
            let point = tp.point();
            beams.iter().any(|(segment, end, ignore)| {
                segment.distance_to(&point) < clean_dist && (*ignore || point.squared_distance_to(end) > clean_sq)
            })
        })
    }
}

impl SensorFusionPolicy for LaserPolicy {
    fn kind(&self) -> &'static str {
        "laser"
    }

    fn process(&mut self, buffers: &mut DeviceBuffers, ctx: &CycleContext<'_>) {
        let Some(scan) = self.source.latest_scan() else {
            return;
        };
        if self.last_counter == Some(scan.counter) {
            return;
        }
        self.last_counter = Some(scan.counter);

        let pose = scan
            .time
            .and_then(|t| ctx.robot.pose_at(t))
            .unwrap_or(ctx.pose);
        let to_global = Transform::new(pose);
        let sensor = to_global.do_transform(&scan.sensor.position());
        let readings: Vec<(Point2D, bool)> = scan
            .raw_readings(ctx.max_range, &self.blind_ranges)
            .into_iter()
            .map(|r| (to_global.do_transform(&r.local), r.ignore))
            .collect();

        let current = buffers.current_mut();
        current.begin_redo();
        for (p, _) in readings.iter().filter(|(_, ignore)| !ignore) {
            current.redo_reading(p.x, p.y, ctx.now);
        }
        current.end_redo();

        if self.clean_due(ctx.now) {
            let cleaned = self.clean_line_of_sight(buffers, sensor, &readings);
            self.last_clean = Some(ctx.now);
            if cleaned > 0 {
                debug!("laser: line of sight cleaned {} cumulative points", cleaned);
            }
        }

        for (p, _) in readings.iter().filter(|(_, ignore)| !ignore) {
            buffers.add_cumulative(p.x, p.y, &ctx.pose, ctx.now);
        }
    }
}

/// Builds a laser range device reading from `source`.
pub fn laser_device(settings: &LaserSettings, source: Arc<dyn LaserSource>, clock: Arc<dyn Clock>) -> RangeDevice {
    let policy = LaserPolicy::new(source, settings);
    RangeDevice::new(&settings.device, Box::new(policy), clock)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::robot::MockRobotState;
    use approx::assert_relative_eq;

    fn scan(counter: u64, beams: &[(f64, f64)]) -> LaserScan {
        LaserScan {
            counter,
            time: None,
            sensor: Pose2D::origin(),
            beams: beams
                .iter()
                .map(|(range, bearing)| LaserBeam {
                    range: *range,
                    bearing: *bearing,
                })
                .collect(),
            error: false,
        }
    }

    fn robot() -> MockRobotState {
        let mut robot = MockRobotState::new();
        robot.expect_pose_at().returning(|_| None);
        robot
    }

    fn ctx<'a>(robot: &'a MockRobotState, now_ms: u64) -> CycleContext<'a> {
        CycleContext {
            pose: Pose2D::origin(),
            robot_radius: 250.0,
            counter: 1,
            now: Timestamp::from_millis(now_ms),
            max_range: 5000.0,
            robot,
        }
    }

    fn policy(mailbox: &Arc<LatestScan>) -> LaserPolicy {
        LaserPolicy::new(mailbox.clone(), &LaserSettings::default())
    }

    fn buffers() -> DeviceBuffers {
        DeviceBuffers::new(100, 100, FilterParams::default())
    }

    #[test]
    fn test_raw_readings_flags() {
        let mut s = scan(1, &[(1000.0, 0.0), (9000.0, 10.0), (1000.0, 95.0)]);
        s.sensor = Pose2D::new(100.0, 0.0, 0.0);
        let raw = s.raw_readings(5000.0, &[AngleRange { start: 80.0, end: 100.0 }]);

        assert!(!raw[0].ignore);
        assert_relative_eq!(raw[0].local.x, 1100.0, epsilon = 1e-9);
        assert!(raw[1].ignore);
        assert_eq!(raw[1].range, 5000.0);
        assert!(raw[2].ignore);

        s.error = true;
        assert!(s.raw_readings(5000.0, &[]).iter().all(|r| r.ignore));
    }

    #[test]
    fn test_scan_replaces_current_once_per_counter() {
        let mailbox = Arc::new(LatestScan::new());
        let mut policy = policy(&mailbox);
        let mut buffers = buffers();
        let robot = robot();

        mailbox.publish(scan(1, &[(1000.0, 0.0), (1000.0, 90.0), (6000.0, 45.0)]));
        policy.process(&mut buffers, &ctx(&robot, 0));
        assert_eq!(buffers.current().len(), 2);

        // Same scan again: nothing changes even if the buffer was cleared.
        buffers.current_mut().clear();
        policy.process(&mut buffers, &ctx(&robot, 100));
        assert!(buffers.current().is_empty());

        mailbox.publish(scan(2, &[(500.0, 0.0)]));
        policy.process(&mut buffers, &ctx(&robot, 200));
        assert_eq!(buffers.current().len(), 1);
        assert_relative_eq!(buffers.current().newest().unwrap().x, 500.0, epsilon = 1e-9);
    }

    #[test]
    fn test_beam_through_stale_point_cleans_it() {
        let mailbox = Arc::new(LatestScan::new());
        let mut policy = policy(&mailbox);
        let mut buffers = buffers();
        let robot = robot();
        // Stale obstacle 1 m ahead, a real one right next to the new return.
        buffers.cumulative_mut().add(1000.0, 10.0, Timestamp::default());
        buffers.cumulative_mut().add(1990.0, 0.0, Timestamp::default());
        // Off to the side of the beam, untouched.
        buffers.cumulative_mut().add(1000.0, 500.0, Timestamp::default());

        mailbox.publish(scan(1, &[(2000.0, 0.0)]));
        policy.process(&mut buffers, &ctx(&robot, 0));

        let xs: Vec<(f64, f64)> = buffers.cumulative().points().map(|p| (p.x, p.y)).collect();
        assert_eq!(xs.len(), 3);
        assert_eq!(xs[0], (1990.0, 0.0));
        assert_eq!(xs[1], (1000.0, 500.0));
        assert_relative_eq!(xs[2].0, 2000.0, epsilon = 1e-9);
    }

    #[test]
    fn test_ignored_beam_cleans_to_its_end() {
        let mailbox = Arc::new(LatestScan::new());
        let mut policy = policy(&mailbox);
        let mut buffers = buffers();
        let robot = robot();
        buffers.cumulative_mut().add(4990.0, 0.0, Timestamp::default());

        // No return: clamped to 5000 and ignored, but it still clears the path.
        mailbox.publish(scan(1, &[(9000.0, 0.0)]));
        policy.process(&mut buffers, &ctx(&robot, 0));
        assert!(buffers.cumulative().is_empty());
        assert!(buffers.current().is_empty());
    }

    #[test]
    fn test_cleaning_is_time_gated() {
        let mailbox = Arc::new(LatestScan::new());
        let mut policy = policy(&mailbox);
        let mut buffers = buffers();
        let robot = robot();

        mailbox.publish(scan(1, &[(2000.0, 0.0)]));
        policy.process(&mut buffers, &ctx(&robot, 0));

        buffers.cumulative_mut().add(1000.0, 0.0, Timestamp::from_millis(100));
        mailbox.publish(scan(2, &[(2000.0, 0.0)]));
        policy.process(&mut buffers, &ctx(&robot, 500));
        assert!(buffers.cumulative().points().any(|p| p.x == 1000.0));

        mailbox.publish(scan(3, &[(2000.0, 0.0)]));
        policy.process(&mut buffers, &ctx(&robot, 1000));
        assert!(!buffers.cumulative().points().any(|p| p.x == 1000.0));
    }

    #[test]
    fn test_no_scan_leaves_buffers_alone() {
        let mut source = MockLaserSource::new();
        source.expect_latest_scan().returning(|| None);
        let mut policy = LaserPolicy::new(Arc::new(source), &LaserSettings::default());
        let mut buffers = buffers();
        buffers.current_mut().add(1.0, 1.0, Timestamp::default());
        let robot = robot();

        policy.process(&mut buffers, &ctx(&robot, 0));
        assert_eq!(buffers.current().len(), 1);
    }

    #[test]
    fn test_scan_time_uses_pose_history() {
        let mailbox = Arc::new(LatestScan::new());
        let mut policy = policy(&mailbox);
        let mut buffers = buffers();
        let mut robot = MockRobotState::new();
        robot
            .expect_pose_at()
            .returning(|_| Some(Pose2D::new(-100.0, 0.0, 0.0)));

        let mut s = scan(1, &[(1000.0, 0.0)]);
        s.time = Some(Timestamp::from_millis(0));
        mailbox.publish(s);
        policy.process(&mut buffers, &ctx(&robot, 50));
        assert_relative_eq!(buffers.current().newest().unwrap().x, 900.0, epsilon = 1e-9);
    }
}
